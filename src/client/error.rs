use std::time::Duration;

/// Failure classes a caller can branch on without reading messages.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out after {attempts} attempt(s) ({timeout:?} per attempt)")]
    Timeout { attempts: u32, timeout: Duration },
    #[error("connection failed after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },
    /// 4xx; never retried.
    #[error("request rejected ({status}): {message}")]
    Api { status: u16, message: String },
    /// 5xx that persisted through every retry.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } | ClientError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::Connection { .. } | ClientError::Server { .. }
        )
    }
}
