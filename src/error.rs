use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure modes of a call routed through the external API gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The current credential ran out of quota or credits.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Every configured credential has been marked exhausted.
    #[error("all credentials exhausted")]
    QuotaExhausted,

    #[error("external call cap of {0} reached for this run")]
    CallCapReached(usize),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// Map a non-success HTTP status to the gateway taxonomy.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
        match status {
            StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
                GatewayError::Quota(detail)
            }
            s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
                GatewayError::Transient(detail)
            }
            _ => GatewayError::Malformed(detail),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            GatewayError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::from_status(status, "")
        } else {
            GatewayError::Malformed(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("incident store unavailable: {0}")]
    Unavailable(String),

    #[error("incident store rejected write: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

/// Conditions that abort a run before any report is processed.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("input file {} does not exist", .0.display())]
    MissingInput(PathBuf),

    #[error("state file {} is corrupted", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_statuses_are_distinguished() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::PAYMENT_REQUIRED, "credits exceeded"),
            GatewayError::Quota(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::Quota(_)
        ));
        assert!(GatewayError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(matches!(
            GatewayError::from_status(StatusCode::BAD_REQUEST, "nope"),
            GatewayError::Malformed(_)
        ));
    }

    #[test]
    fn only_unavailable_store_errors_retry() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::Rejected("constraint".into()).is_retryable());
    }
}
