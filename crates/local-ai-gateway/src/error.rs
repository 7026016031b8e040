//! Error types shared by the conversion framework, the task engine and the
//! model lifecycle manager.
//!
//! ```text
//! GatewayError
//! ├── Config            -- bad dialect definition, unknown converter (fatal at load)
//! ├── FlavorNotFound    -- dialect not registered
//! ├── NotFound          -- no service / provider / target for the request
//! ├── Conversion        -- a conversion step failed
//! ├── Drop              -- "suppress this chunk" signal, recoverable
//! ├── Upstream          -- provider answered with a non-2xx status
//! ├── Http              -- transport failure talking to a provider
//! ├── Auth              -- authenticator could not sign the request
//! ├── Lifecycle         -- load / unload / switch failure
//! ├── QueueTimeout      -- admission queue did not accept in time
//! ├── QueueClosed       -- lifecycle manager stopped
//! └── Serialization     -- JSON / YAML decoding
//! ```

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Non-2xx answer from a service provider, kept whole so callers can map the
/// upstream status code.
#[derive(Debug, Clone)]
pub struct HttpErrorResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl fmt::Display for HttpErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "upstream returned {}: {}",
            self.status,
            String::from_utf8_lossy(&self.body)
        )
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("API flavor {0} not found")]
    FlavorNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conversion step '{step}' failed: {reason}")]
    Conversion { step: String, reason: String },

    #[error("content dropped by converter")]
    Drop,

    #[error("{0}")]
    Upstream(HttpErrorResponse),

    #[error("request to service provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("model lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("local model queue is full, timed out after {0:?}")]
    QueueTimeout(Duration),

    #[error("local model queue is not running")]
    QueueClosed,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        GatewayError::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GatewayError::NotFound(msg.into())
    }

    pub fn conversion(step: impl Into<String>, reason: impl fmt::Display) -> Self {
        GatewayError::Conversion {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the drop signal, which only suppresses one stream chunk.
    pub fn is_drop(&self) -> bool {
        matches!(self, GatewayError::Drop)
    }

    /// HTTP status a front door should answer with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::FlavorNotFound(_)
            | GatewayError::NotFound(_)
            | GatewayError::Lifecycle(LifecycleError::ModelNotFound(_)) => StatusCode::NOT_FOUND,
            GatewayError::Lifecycle(LifecycleError::ModelInUse(_)) => StatusCode::CONFLICT,
            GatewayError::Upstream(resp) => resp.status,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::QueueTimeout(_) | GatewayError::QueueClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Serialization(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_)
            | GatewayError::Conversion { .. }
            | GatewayError::Drop
            | GatewayError::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(e: serde_yaml::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

/// Failures of the local model lifecycle. Cloneable so that every waiter of a
/// failed load receives the same error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("model {0} not found")]
    ModelNotFound(String),

    #[error("model {0} is in use")]
    ModelInUse(String),

    #[error("model {model} is {status}, not resident")]
    ModelNotReady { model: String, status: String },

    #[error("failed to load model {model}: {reason}")]
    LoadFailed { model: String, reason: String },

    #[error("failed to unload model {model}: {reason}")]
    UnloadFailed { model: String, reason: String },

    #[error("engine error: {0}")]
    Engine(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_is_recognised() {
        assert!(GatewayError::Drop.is_drop());
        assert!(!GatewayError::not_found("x").is_drop());
    }

    #[test]
    fn test_upstream_status_is_preserved() {
        let err = GatewayError::Upstream(HttpErrorResponse {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"model not found"),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert!(err.to_string().contains("model not found"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::not_found("svc").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::QueueTimeout(Duration::from_secs(1)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::conversion("json_map", "bad pointer").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_lifecycle_error_converts() {
        let err: GatewayError = LifecycleError::ModelNotFound("m1".into()).into();
        assert!(matches!(err, GatewayError::Lifecycle(_)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        let err: GatewayError = LifecycleError::ModelInUse("m1".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let err: GatewayError = LifecycleError::Engine("boom".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
