use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LensError>;

#[derive(Debug, Clone, Error)]
pub enum LensError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("service returned {status}: {message}")]
    Protocol { status: StatusCode, message: String },
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("undecodable frame: {0}")]
    FrameDecode(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("analysis failed: {0}")]
    Systemic(String),
}

/// Coarse classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transport,
    Protocol,
    FrameDecode,
    Systemic,
}

impl LensError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LensError::Validation(_) => ErrorKind::Validation,
            LensError::Transport(_) | LensError::Timeout(_) | LensError::Cancelled => {
                ErrorKind::Transport
            }
            LensError::Protocol { .. } | LensError::Payload(_) => ErrorKind::Protocol,
            LensError::FrameDecode(_) => ErrorKind::FrameDecode,
            LensError::Systemic(_) => ErrorKind::Systemic,
        }
    }

    /// Validation and systemic failures block the caller; everything else is
    /// recorded or logged.
    pub fn is_user_visible(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Systemic)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LensError::Timeout(_))
    }
}

impl From<reqwest::Error> for LensError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LensError::Timeout(err.to_string())
        } else if err.is_decode() {
            LensError::Payload(err.to_string())
        } else if let Some(status) = err.status() {
            LensError::Protocol {
                status,
                message: err.to_string(),
            }
        } else {
            LensError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LensError {
    fn from(err: serde_json::Error) -> Self {
        LensError::Payload(err.to_string())
    }
}
