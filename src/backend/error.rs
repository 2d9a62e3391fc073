use std::error::Error as _;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Failure talking to a proxy controller
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Connection refused, reset, timed out or closed by the peer
    #[error("transport error: {0}")]
    Transport(String),

    /// TLS handshake or certificate failure
    #[error("TLS failure: {0}")]
    Tls(String),

    /// Controller rejected our credentials (HTTP 401/403)
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Payload did not match the expected schema
    #[error("malformed payload: {0}")]
    Decode(String),

    /// Server entry is missing a URL or credentials
    #[error("configuration error: {0}")]
    Config(String),

    /// Controller answered with an unexpected status
    #[error("controller returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl BackendError {
    /// No automatic retry makes sense for this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::Auth(_) | BackendError::Config(_) | BackendError::Tls(_)
        )
    }

    /// The resulting error state must survive generic state updates.
    pub fn is_sticky(&self) -> bool {
        matches!(self, BackendError::Auth(_) | BackendError::Tls(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, BackendError::Decode(_))
    }

    /// Build an error from a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        let body = if body.is_empty() {
            "No details".to_string()
        } else {
            body
        };
        match status {
            401 | 403 => BackendError::Auth(format!("HTTP {} - {}", status, body)),
            _ => BackendError::Status { status, body },
        }
    }
}

fn looks_like_tls(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        let text = current.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return true;
        }
        source = current.source();
    }
    false
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return BackendError::Decode(err.to_string());
        }
        if err.is_timeout() {
            return BackendError::Transport(format!("request timed out: {}", err));
        }
        if let Some(status) = err.status() {
            return BackendError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_connect() && err.source().map(looks_like_tls).unwrap_or(false) {
            return BackendError::Tls(err.to_string());
        }
        BackendError::Transport(err.to_string())
    }
}

impl From<tungstenite::Error> for BackendError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                BackendError::from_status(status, body)
            }
            tungstenite::Error::Tls(tls) => BackendError::Tls(tls.to_string()),
            tungstenite::Error::Url(url) => BackendError::Config(url.to_string()),
            other => BackendError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Decode(err.to_string())
    }
}

impl From<url::ParseError> for BackendError {
    fn from(err: url::ParseError) -> Self {
        BackendError::Config(format!("invalid controller URL: {}", err))
    }
}
