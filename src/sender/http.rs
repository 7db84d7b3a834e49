use super::{SendError, TopicSender, UploadSender};
use crate::domain::{RecordBatch, RecordKey, Topic};
use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use reqwest::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub user_agent: String,
    pub enable_compression: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            auth_token: None,
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            user_agent: format!("spool-forwarder/{}", env!("CARGO_PKG_VERSION")),
            enable_compression: true,
        }
    }
}

#[derive(Serialize)]
struct UploadBody<'a> {
    key: &'a RecordKey,
    records: &'a [Value],
}

/// Uploads records to `POST {endpoint}/topics/{topic}` and checks reachability with
/// `GET {endpoint}/health`.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: Client,
    config: SenderConfig,
    endpoint_url: Url,
    connected: Arc<AtomicBool>,
}

impl HttpSender {
    pub fn new(config: SenderConfig) -> Result<Self, SendError> {
        let endpoint_url: Url = config
            .endpoint
            .parse()
            .map_err(|e| SendError::InvalidConfig(format!("Invalid endpoint URL: {}", e)))?;
        if endpoint_url.cannot_be_a_base() {
            return Err(SendError::InvalidConfig(format!(
                "Endpoint URL {} cannot have a path",
                endpoint_url
            )));
        }

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                SendError::InvalidConfig(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            config,
            endpoint_url,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SendError> {
        let mut url = self.endpoint_url.clone();
        url.path_segments_mut()
            .map_err(|_| SendError::InvalidConfig("Endpoint URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn auth_headers(&self) -> Result<HeaderMap, SendError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SendError::InvalidConfig(format!("Invalid auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl UploadSender for HttpSender {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn reset_connection(&self) -> Result<bool, SendError> {
        let health_url = self.url(&["health"])?;
        let response = match self
            .client
            .get(health_url)
            .headers(self.auth_headers()?)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Health check failed: {}", e);
                self.connected.store(false, Ordering::Release);
                return Ok(false);
            }
        };

        let status = response.status();
        if is_auth_failure(status) {
            self.connected.store(false, Ordering::Release);
            return Err(SendError::Authentication(format!(
                "Health check rejected with {}",
                status
            )));
        }

        let connected = status.is_success();
        if !connected {
            warn!("Health check returned HTTP {}", status);
        }
        self.connected.store(connected, Ordering::Release);
        Ok(connected)
    }

    fn topic_sender(&self, topic: &Topic) -> Result<Box<dyn TopicSender>, SendError> {
        let url = self.url(&["topics", &topic.name])?;
        Ok(Box::new(HttpTopicSender {
            client: self.client.clone(),
            url,
            headers: self.auth_headers()?,
            enable_compression: self.config.enable_compression,
            connected: Arc::clone(&self.connected),
        }))
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Topic sender created by [`HttpSender::topic_sender`].
pub struct HttpTopicSender {
    client: Client,
    url: Url,
    headers: HeaderMap,
    enable_compression: bool,
    connected: Arc<AtomicBool>,
}

impl HttpTopicSender {
    fn prepare_payload(&self, batch: &RecordBatch) -> Result<Vec<u8>, SendError> {
        let body = serde_json::to_vec(&UploadBody {
            key: &batch.key,
            records: &batch.values,
        })?;
        if !self.enable_compression {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }

    fn build_headers(&self, batch: &RecordBatch) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if self.enable_compression {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        headers.insert(
            HeaderName::from_static("x-record-count"),
            HeaderValue::from(batch.len()),
        );
        headers
    }
}

#[async_trait]
impl TopicSender for HttpTopicSender {
    async fn send(&self, batch: &RecordBatch) -> Result<(), SendError> {
        let payload = self.prepare_payload(batch)?;
        let bytes_sent = payload.len();

        let response = match self
            .client
            .post(self.url.clone())
            .headers(self.build_headers(batch))
            .body(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                return Err(SendError::Request(e));
            }
        };

        check_response(response).await?;
        self.connected.store(true, Ordering::Release);
        info!(
            "Sent {} records of topic {} ({} bytes)",
            batch.len(),
            batch.topic,
            bytes_sent
        );
        Ok(())
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn check_response(response: Response) -> Result<(), SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    if is_auth_failure(status) {
        Err(SendError::Authentication(format!("HTTP {}: {}", status, message)))
    } else {
        Err(SendError::Http {
            status: status.as_u16(),
            message,
        })
    }
}
