use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DefinitionSource, Flavor, CANONICAL_FLAVOR};
use crate::convert::ConversionKind;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{ConvertContext, HttpContent};

/// Process-scoped set of dialects. Populated once at startup, then shared
/// read-only behind an `Arc`; per-flavor reloads go through the flavor's own
/// atomic state swap, not through this map.
#[derive(Debug, Default)]
pub struct FlavorRegistry {
    flavors: HashMap<String, Arc<Flavor>>,
}

impl FlavorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and compiles every definition available from `source`. Any bad
    /// definition fails the whole load.
    pub fn load(source: &DefinitionSource) -> GatewayResult<Self> {
        let mut registry = Self::new();
        for name in source.names()? {
            let def = source.load(&name)?;
            registry.register(Flavor::new(def, source.clone())?);
        }
        if registry.get(CANONICAL_FLAVOR).is_err() {
            return Err(GatewayError::config(format!(
                "canonical flavor '{}' definition is missing",
                CANONICAL_FLAVOR
            )));
        }
        info!("📚 Loaded {} API flavors: {:?}", registry.flavors.len(), registry.names());
        Ok(registry)
    }

    pub fn register(&mut self, flavor: Flavor) {
        debug!(flavor = flavor.name(), "registering flavor");
        self.flavors.insert(flavor.name().to_string(), Arc::new(flavor));
    }

    pub fn get(&self, name: &str) -> GatewayResult<Arc<Flavor>> {
        self.flavors
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::FlavorNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flavors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Flavor>> {
        self.flavors.values()
    }

    pub fn reload(&self, name: &str) -> GatewayResult<()> {
        self.get(name)?.reload()
    }

    /// Converts `content` from one dialect to another through the canonical
    /// form. Same-dialect conversion returns the input untouched; otherwise
    /// `Content-Length` is dropped since the body size may change. A failure
    /// at either stage aborts with that stage's error.
    pub fn convert_between(
        &self,
        from: &str,
        to: &str,
        service: &str,
        kind: ConversionKind,
        content: &HttpContent,
        ctx: &ConvertContext,
    ) -> GatewayResult<HttpContent> {
        if from == to {
            return Ok(content.clone());
        }
        let from_flavor = self.get(from)?;
        let to_flavor = self.get(to)?;

        let mut current = content.clone();
        current.headers.remove(axum::http::header::CONTENT_LENGTH);

        if !from_flavor.is_canonical() {
            current = from_flavor.convert(service, kind.to_canonical(), &current, ctx)?;
        }
        if !to_flavor.is_canonical() {
            current = to_flavor.convert(service, kind.from_canonical(), &current, ctx)?;
        }
        Ok(current)
    }
}
