//! Data carriers shared across the gateway: wire payloads, conversion context,
//! persisted service/provider records and per-task request/target/result.

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

pub const SERVICE_CHAT: &str = "chat";
pub const SERVICE_GENERATE: &str = "generate";
pub const SERVICE_EMBED: &str = "embed";
pub const SERVICE_MODELS: &str = "models";
pub const SERVICE_TEXT_TO_IMAGE: &str = "text_to_image";

pub const SUPPORTED_SERVICES: &[&str] = &[
    SERVICE_CHAT,
    SERVICE_GENERATE,
    SERVICE_EMBED,
    SERVICE_MODELS,
    SERVICE_TEXT_TO_IMAGE,
];

pub const FLAVOR_OLLAMA: &str = "ollama";
pub const FLAVOR_TENCENT: &str = "tencent";

/// Header + body pair in transit. Conversion steps build new values rather
/// than mutating the one they were given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpContent {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpContent {
    pub fn new(headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self::new(HeaderMap::new(), body)
    }

    pub fn with_body(&self, body: impl Into<Bytes>) -> Self {
        Self {
            headers: self.headers.clone(),
            body: body.into(),
        }
    }

    pub fn json(&self) -> Result<serde_json::Value, GatewayError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Side-channel values threaded through one conversion (target model, stream
/// flag, response id, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertContext {
    values: HashMap<String, serde_json::Value>,
}

impl ConvertContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn stream(&self) -> bool {
        self.get("stream").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn model(&self) -> Option<&str> {
        self.get("model").and_then(|v| v.as_str())
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = GatewayError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(GatewayError::config(format!(
                        "invalid {} value: {}", stringify!($name), other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Local,
    Remote,
}

string_enum!(Location { Local => "local", Remote => "remote" });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridPolicy {
    #[default]
    Default,
    AlwaysLocal,
    AlwaysRemote,
}

string_enum!(HybridPolicy {
    Default => "default",
    AlwaysLocal => "always_local",
    AlwaysRemote => "always_remote",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "apikey")]
    ApiKey,
    #[serde(rename = "token")]
    Token,
    #[serde(rename = "credentials")]
    Credentials,
}

string_enum!(AuthType {
    None => "none",
    ApiKey => "apikey",
    Token => "token",
    Credentials => "credentials",
});

/// Persisted per-service routing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub hybrid_policy: HybridPolicy,
    #[serde(default)]
    pub remote_provider: String,
    #[serde(default)]
    pub local_provider: String,
    #[serde(default = "default_enabled")]
    pub status: i32,
}

fn default_enabled() -> i32 {
    1
}

fn default_json_object() -> String {
    "{}".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

/// A configured destination, as persisted by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProvider {
    #[serde(default)]
    pub id: i64,
    pub provider_name: String,
    pub service_name: String,
    pub service_source: Location,
    #[serde(default)]
    pub desc: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_key: String,
    pub flavor: String,
    #[serde(default = "default_json_object")]
    pub extra_headers: String,
    #[serde(default = "default_json_object")]
    pub extra_json_body: String,
    #[serde(default = "default_json_object")]
    pub properties: String,
    #[serde(default = "default_enabled")]
    pub status: i32,
}

/// Decoded `ServiceProvider::properties`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderProperties {
    #[serde(default)]
    pub max_input_tokens: u32,
    #[serde(default)]
    pub supported_response_mode: Vec<String>,
    #[serde(default)]
    pub mode_is_changeable: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub xpu: Vec<String>,
}

impl ServiceProvider {
    pub fn is_enabled(&self) -> bool {
        self.status != 0
    }

    /// Malformed or empty properties decode to the defaults.
    pub fn properties(&self) -> ProviderProperties {
        serde_json::from_str(&self.properties).unwrap_or_default()
    }

    pub fn supports_stream(&self) -> bool {
        let props = self.properties();
        props.supported_response_mode.is_empty()
            || props.supported_response_mode.iter().any(|m| m == "stream")
    }
}

/// Persisted model record; only its status is touched by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_name: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub status: String,
}

/// Canonical inbound ask, immutable once created.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service: String,
    pub model: Option<String>,
    pub from_flavor: String,
    pub hybrid_policy: HybridPolicy,
    pub ask_stream: bool,
    pub think: bool,
    pub http: HttpContent,
}

/// Destination resolved by the dispatcher for one request.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub location: Location,
    pub to_flavor: String,
    pub model: String,
    pub provider: ServiceProvider,
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Chunk,
    Done,
    Failed,
}

impl ResultKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultKind::Chunk)
    }
}

/// One unit of task output. A task emits zero or more chunks followed by
/// exactly one `Done` or `Failed`.
#[derive(Debug)]
pub struct ServiceResult {
    pub kind: ResultKind,
    pub task_id: u64,
    pub status: StatusCode,
    pub http: HttpContent,
    pub error: Option<GatewayError>,
}

impl ServiceResult {
    pub fn chunk(task_id: u64, http: HttpContent) -> Self {
        Self {
            kind: ResultKind::Chunk,
            task_id,
            status: StatusCode::OK,
            http,
            error: None,
        }
    }

    pub fn done(task_id: u64, status: StatusCode, http: HttpContent) -> Self {
        Self {
            kind: ResultKind::Done,
            task_id,
            status,
            http,
            error: None,
        }
    }

    pub fn failed(task_id: u64, error: GatewayError) -> Self {
        let (status, http) = match &error {
            GatewayError::Upstream(resp) => (
                resp.status,
                HttpContent::new(resp.headers.clone(), resp.body.clone()),
            ),
            other => (
                other.status_code(),
                HttpContent::from_body(
                    serde_json::json!({ "error": other.to_string() }).to_string(),
                ),
            ),
        };
        Self {
            kind: ResultKind::Failed,
            task_id,
            status,
            http,
            error: Some(error),
        }
    }
}
