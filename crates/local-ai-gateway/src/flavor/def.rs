//! Dialect definition files (`<flavor>.yaml`) and where they are read from.

use include_dir::{include_dir, Dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::convert::{Conversion, StepDef};
use crate::error::{GatewayError, GatewayResult};
use crate::types::AuthType;

static BUILTIN_FLAVORS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/flavors");

/// Stream fragments plus the conversion step list for one direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionDef {
    #[serde(default)]
    pub prologue: Vec<String>,
    #[serde(default)]
    pub epilogue: Vec<String>,
    #[serde(default)]
    pub conversion: Vec<StepDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub install_raw_routes: bool,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub extra_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub auth_apply_url: String,
    #[serde(default = "one")]
    pub request_segments: u32,
    #[serde(default)]
    pub extra_headers: String,
    #[serde(default)]
    pub support_models: Vec<String>,
    #[serde(default)]
    pub request_to_canonical: ConversionDef,
    #[serde(default)]
    pub request_from_canonical: ConversionDef,
    #[serde(default)]
    pub response_to_canonical: ConversionDef,
    #[serde(default)]
    pub response_from_canonical: ConversionDef,
    #[serde(default)]
    pub stream_response_to_canonical: ConversionDef,
    #[serde(default)]
    pub stream_response_from_canonical: ConversionDef,
}

fn one() -> u32 {
    1
}

impl ServiceDef {
    pub fn conversion(&self, conversion: Conversion) -> &ConversionDef {
        match conversion {
            Conversion::RequestToCanonical => &self.request_to_canonical,
            Conversion::RequestFromCanonical => &self.request_from_canonical,
            Conversion::ResponseToCanonical => &self.response_to_canonical,
            Conversion::ResponseFromCanonical => &self.response_from_canonical,
            Conversion::StreamResponseToCanonical => &self.stream_response_to_canonical,
            Conversion::StreamResponseFromCanonical => &self.stream_response_from_canonical,
        }
    }

    /// Parsed `METHOD /path` endpoint templates. A malformed entry is a
    /// configuration error.
    pub fn routes(&self) -> GatewayResult<Vec<(String, String)>> {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let mut parts = endpoint.trim().splitn(2, ' ');
                match (parts.next(), parts.next()) {
                    (Some(method), Some(path)) if !method.is_empty() => {
                        let path = path.trim();
                        let path = if path.starts_with('/') {
                            path.to_string()
                        } else {
                            format!("/{}", path)
                        };
                        Ok((method.trim().to_uppercase(), path))
                    }
                    _ => Err(GatewayError::config(format!(
                        "invalid endpoint format '{}'",
                        endpoint
                    ))),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlavorDef {
    #[serde(default)]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDef>,
}

impl FlavorDef {
    pub fn from_yaml(expected_name: &str, text: &str) -> GatewayResult<Self> {
        let def: FlavorDef = serde_yaml::from_str(text).map_err(|e| {
            GatewayError::config(format!("invalid definition for flavor {}: {}", expected_name, e))
        })?;
        if def.name != expected_name {
            return Err(GatewayError::config(format!(
                "flavor name {} does not match file name {}",
                def.name, expected_name
            )));
        }
        Ok(def)
    }
}

/// Where dialect definitions come from: the embedded set or a directory.
#[derive(Debug, Clone, Default)]
pub enum DefinitionSource {
    #[default]
    Builtin,
    Directory(PathBuf),
}

impl DefinitionSource {
    pub fn from_option(dir: Option<&str>) -> Self {
        match dir {
            Some(d) if !d.is_empty() => DefinitionSource::Directory(PathBuf::from(d)),
            _ => DefinitionSource::Builtin,
        }
    }

    /// Names of every `<name>.yaml` available, sorted.
    pub fn names(&self) -> GatewayResult<Vec<String>> {
        let mut names: Vec<String> = match self {
            DefinitionSource::Builtin => BUILTIN_FLAVORS
                .files()
                .filter_map(|f| yaml_stem(f.path()))
                .collect(),
            DefinitionSource::Directory(dir) => std::fs::read_dir(dir)
                .map_err(|e| {
                    GatewayError::config(format!("cannot read flavor dir {}: {}", dir.display(), e))
                })?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_file())
                .filter_map(|entry| yaml_stem(&entry.path()))
                .collect(),
        };
        names.sort();
        Ok(names)
    }

    /// Reads and validates one definition. Called again on reload so file
    /// edits take effect.
    pub fn load(&self, name: &str) -> GatewayResult<FlavorDef> {
        let file = format!("{}.yaml", name);
        let text = match self {
            DefinitionSource::Builtin => BUILTIN_FLAVORS
                .get_file(&file)
                .and_then(|f| f.contents_utf8())
                .map(str::to_string)
                .ok_or_else(|| GatewayError::FlavorNotFound(name.to_string()))?,
            DefinitionSource::Directory(dir) => {
                let path = dir.join(&file);
                std::fs::read_to_string(&path).map_err(|e| {
                    GatewayError::config(format!("cannot read {}: {}", path.display(), e))
                })?
            }
        };
        FlavorDef::from_yaml(name, &text)
    }
}

fn yaml_stem(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "yaml" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}
