use std::time::Duration;

/// Convenient Result alias.
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent error type.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Throttled by server, retry after {0:?}")]
    Throttled(Duration),

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether retrying with the same credential can succeed.
    ///
    /// Client errors (4xx other than 408) mean the request itself is refused;
    /// a `{success: false}` body is reported with status 200 and stays retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unauthorized(_) => false,
            Self::Server { status, .. } => !(400..500).contains(status) || *status == 408,
            Self::Throttled(_)
            | Self::Timeout
            | Self::Transport(_)
            | Self::Http(_)
            | Self::Protocol(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_terminal() {
        assert!(!AgentError::Unauthorized("revoked".into()).is_retryable());
        assert!(!AgentError::Server {
            status: 404,
            message: "unknown device".into()
        }
        .is_retryable());
    }

    #[test]
    fn transient_failures_are_retryable() {
        assert!(AgentError::Timeout.is_retryable());
        assert!(AgentError::Transport("reset by peer".into()).is_retryable());
        assert!(AgentError::Server {
            status: 408,
            message: String::new()
        }
        .is_retryable());
        assert!(AgentError::Server {
            status: 200,
            message: "heartbeat rejected".into()
        }
        .is_retryable());
        assert!(AgentError::Server {
            status: 503,
            message: "maintenance".into()
        }
        .is_retryable());
    }
}
