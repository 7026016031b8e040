//! Named conversion steps.
//!
//! Every step is compiled once from its `{converter, config}` definition and is
//! pure afterwards: `apply` borrows the input content and returns a new one.

use axum::http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::pointer;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ConvertContext, HttpContent};

/// Declarative form of one step, as written in a dialect definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub converter: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone)]
pub enum ConversionStep {
    Header(HeaderStep),
    JsonMap(JsonMapStep),
    DropIf(DropIfStep),
    StreamFlag(StreamFlagStep),
    RenameKeys(RenameKeysStep),
}

impl ConversionStep {
    /// Compiles a step. Unknown converter names and malformed configs are
    /// configuration errors.
    pub fn build(def: &StepDef) -> GatewayResult<Self> {
        let config = if def.config.is_null() {
            Value::Object(Default::default())
        } else {
            def.config.clone()
        };
        let step = match def.converter.as_str() {
            "header" => ConversionStep::Header(HeaderStep::build(parse_config(&def.converter, config)?)?),
            "json_map" => ConversionStep::JsonMap(JsonMapStep::build(parse_config(&def.converter, config)?)?),
            "drop_if" => ConversionStep::DropIf(DropIfStep::build(parse_config(&def.converter, config)?)?),
            "stream_flag" => ConversionStep::StreamFlag(parse_config(&def.converter, config)?),
            "rename_keys" => ConversionStep::RenameKeys(parse_config(&def.converter, config)?),
            other => {
                return Err(GatewayError::config(format!("unknown converter '{}'", other)));
            }
        };
        Ok(step)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConversionStep::Header(_) => "header",
            ConversionStep::JsonMap(_) => "json_map",
            ConversionStep::DropIf(_) => "drop_if",
            ConversionStep::StreamFlag(_) => "stream_flag",
            ConversionStep::RenameKeys(_) => "rename_keys",
        }
    }

    pub fn apply(&self, content: &HttpContent, ctx: &ConvertContext) -> GatewayResult<HttpContent> {
        match self {
            ConversionStep::Header(step) => Ok(step.apply(content)),
            ConversionStep::JsonMap(step) => step.apply(content, ctx),
            ConversionStep::DropIf(step) => step.apply(content),
            ConversionStep::StreamFlag(step) => step.apply(content, ctx),
            ConversionStep::RenameKeys(step) => step.apply(content),
        }
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(converter: &str, config: Value) -> GatewayResult<T> {
    serde_json::from_value(config)
        .map_err(|e| GatewayError::config(format!("invalid config for converter '{}': {}", converter, e)))
}

fn parse_body(step: &str, content: &HttpContent) -> GatewayResult<Value> {
    if content.body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&content.body).map_err(|e| GatewayError::conversion(step, e))
}

fn write_body(step: &str, content: &HttpContent, body: &Value) -> GatewayResult<HttpContent> {
    let bytes = serde_json::to_vec(body).map_err(|e| GatewayError::conversion(step, e))?;
    Ok(content.with_body(bytes))
}

// ===== header =====

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderConfig {
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HeaderStep {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderStep {
    fn build(config: HeaderConfig) -> GatewayResult<Self> {
        let set = config
            .set
            .into_iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| GatewayError::config(format!("bad header name {}: {}", name, e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| GatewayError::config(format!("bad header value {}: {}", value, e)))?;
                Ok((name, value))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        let remove = config
            .remove
            .into_iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| GatewayError::config(format!("bad header name {}: {}", name, e)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { set, remove })
    }

    fn apply(&self, content: &HttpContent) -> HttpContent {
        let mut out = content.clone();
        for name in &self.remove {
            out.headers.remove(name);
        }
        for (name, value) in &self.set {
            out.headers.insert(name.clone(), value.clone());
        }
        out
    }
}

// ===== json_map =====

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapBase {
    #[default]
    Keep,
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    to: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    default: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonMapConfig {
    #[serde(default)]
    base: MapBase,
    #[serde(default)]
    fields: Vec<FieldConfig>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum FieldSource {
    Pointer(String),
    Literal(Value),
    Context(String),
}

#[derive(Debug, Clone)]
struct FieldMapping {
    to: String,
    source: FieldSource,
    default: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct JsonMapStep {
    base: MapBase,
    fields: Vec<FieldMapping>,
    remove: Vec<String>,
}

fn check_pointer(p: &str) -> GatewayResult<()> {
    if p.is_empty() || p.starts_with('/') {
        Ok(())
    } else {
        Err(GatewayError::config(format!("invalid JSON pointer '{}'", p)))
    }
}

impl JsonMapStep {
    fn build(config: JsonMapConfig) -> GatewayResult<Self> {
        let mut fields = Vec::with_capacity(config.fields.len());
        for field in config.fields {
            check_pointer(&field.to)?;
            let source = match (field.from, field.value, field.context) {
                (Some(from), None, None) => {
                    check_pointer(&from)?;
                    FieldSource::Pointer(from)
                }
                (None, Some(value), None) => FieldSource::Literal(value),
                (None, None, Some(key)) => FieldSource::Context(key),
                _ => {
                    return Err(GatewayError::config(format!(
                        "json_map field '{}' needs exactly one of from, value, context",
                        field.to
                    )));
                }
            };
            fields.push(FieldMapping {
                to: field.to,
                source,
                default: field.default,
            });
        }
        for p in &config.remove {
            check_pointer(p)?;
        }
        Ok(Self {
            base: config.base,
            fields,
            remove: config.remove,
        })
    }

    fn apply(&self, content: &HttpContent, ctx: &ConvertContext) -> GatewayResult<HttpContent> {
        let input = parse_body("json_map", content)?;
        let mut output = match self.base {
            MapBase::Keep if !input.is_null() => input.clone(),
            _ => Value::Object(Default::default()),
        };

        for field in &self.fields {
            let found = match &field.source {
                FieldSource::Pointer(p) => pointer::get(&input, p).cloned(),
                FieldSource::Literal(v) => Some(v.clone()),
                FieldSource::Context(key) => ctx.get(key).cloned(),
            };
            let Some(value) = found.or_else(|| field.default.clone()) else {
                continue;
            };
            if !pointer::set(&mut output, &field.to, value) {
                return Err(GatewayError::conversion(
                    "json_map",
                    format!("cannot write to '{}'", field.to),
                ));
            }
        }

        for p in &self.remove {
            pointer::remove(&mut output, p);
        }
        write_body("json_map", content, &output)
    }
}

// ===== drop_if =====

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropIfConfig {
    #[serde(default)]
    body_equals: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    equals: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DropIfStep {
    body_equals: Option<String>,
    path_equals: Option<(String, Value)>,
}

impl DropIfStep {
    fn build(config: DropIfConfig) -> GatewayResult<Self> {
        let path_equals = match (config.path, config.equals) {
            (Some(path), Some(equals)) => {
                check_pointer(&path)?;
                Some((path, equals))
            }
            (None, None) => None,
            _ => return Err(GatewayError::config("drop_if needs both path and equals")),
        };
        if config.body_equals.is_none() && path_equals.is_none() {
            return Err(GatewayError::config("drop_if needs body_equals or path/equals"));
        }
        Ok(Self {
            body_equals: config.body_equals,
            path_equals,
        })
    }

    fn apply(&self, content: &HttpContent) -> GatewayResult<HttpContent> {
        if let Some(expected) = &self.body_equals {
            if String::from_utf8_lossy(&content.body).trim() == expected.as_str() {
                return Err(GatewayError::Drop);
            }
        }
        if let Some((path, equals)) = &self.path_equals {
            // Non-JSON bodies never match.
            if let Ok(body) = serde_json::from_slice::<Value>(&content.body) {
                if pointer::get(&body, path) == Some(equals) {
                    return Err(GatewayError::Drop);
                }
            }
        }
        Ok(content.clone())
    }
}

// ===== stream_flag =====

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamFlagStep {
    path: String,
}

impl StreamFlagStep {
    fn apply(&self, content: &HttpContent, ctx: &ConvertContext) -> GatewayResult<HttpContent> {
        let mut body = parse_body("stream_flag", content)?;
        if body.is_null() {
            body = Value::Object(Default::default());
        }
        if !pointer::set(&mut body, &self.path, Value::Bool(ctx.stream())) {
            return Err(GatewayError::conversion(
                "stream_flag",
                format!("cannot write to '{}'", self.path),
            ));
        }
        write_body("stream_flag", content, &body)
    }
}

// ===== rename_keys =====

/// Renames object keys at `path`; for an array, in every object element.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameKeysStep {
    #[serde(default)]
    path: String,
    keys: BTreeMap<String, String>,
}

impl RenameKeysStep {
    fn rename(&self, object: &mut serde_json::Map<String, Value>) {
        for (old, new) in &self.keys {
            if let Some(v) = object.remove(old) {
                object.insert(new.clone(), v);
            }
        }
    }

    fn apply(&self, content: &HttpContent) -> GatewayResult<HttpContent> {
        let mut body = parse_body("rename_keys", content)?;
        match body.pointer_mut(&self.path) {
            Some(Value::Object(object)) => self.rename(object),
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::Object(object) = item {
                        self.rename(object);
                    }
                }
            }
            _ => return Ok(content.clone()),
        }
        write_body("rename_keys", content, &body)
    }
}
