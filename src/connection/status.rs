use serde::{Deserialize, Serialize};
use std::fmt;

/// Observable state of the connection to the ingestion server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
    Uploading,
    UploadingFailed,
    Unauthorized,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Uploading => "uploading",
            ServerStatus::UploadingFailed => "uploading_failed",
            ServerStatus::Unauthorized => "unauthorized",
        };
        f.write_str(name)
    }
}
