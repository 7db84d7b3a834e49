use super::config::LogLevel;
use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Noisy dependencies capped at `warn` unless `RUST_LOG` says otherwise.
const DEFAULT_DIRECTIVES: &[&str] = &["hyper=warn", "reqwest=warn", "h2=warn", "rustls=warn"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("Failed to install tracing subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Filter used when `RUST_LOG` is not set.
pub fn build_filter_string(level: LogLevel) -> String {
    std::iter::once(level.as_str())
        .chain(DEFAULT_DIRECTIVES.iter().copied())
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn setup_logging(level: LogLevel, json: bool) -> Result<(), LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let filter = build_filter_string(level);
            EnvFilter::try_new(&filter)
                .map_err(|source| LoggingError::InvalidFilter { filter, source })?
        }
    };

    let json_layer = json.then(|| fmt::layer().json().with_target(true).with_current_span(false));
    let compact_layer = (!json).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .compact()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(compact_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_string() {
        let filter = build_filter_string(LogLevel::Debug);
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }

    #[test]
    fn test_second_setup_fails_without_panicking() {
        // the first call may already lose against another test
        let _ = setup_logging(LogLevel::Info, false);
        assert!(matches!(
            setup_logging(LogLevel::Info, true),
            Err(LoggingError::Install(_))
        ));
    }
}
