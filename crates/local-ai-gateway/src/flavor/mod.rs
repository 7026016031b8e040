//! API dialects ("flavors").
//!
//! A `Flavor` owns the compiled pipelines for every service it declares.
//! Reloading builds a complete new `FlavorState` first and then swaps it in
//! with one atomic store, so requests already holding the old state finish on
//! it and never observe a half-built pipeline map.

pub mod def;
pub mod registry;

pub use def::{ConversionDef, DefinitionSource, FlavorDef, ServiceDef};
pub use registry::FlavorRegistry;

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::convert::{Conversion, ConverterPipeline};
use crate::error::GatewayResult;
use crate::types::{ConvertContext, HttpContent};

/// Name of the canonical pseudo-dialect.
pub const CANONICAL_FLAVOR: &str = "gateway";

#[derive(Debug, Default)]
struct ServicePipelines {
    by_direction: Vec<ConverterPipeline>,
}

impl ServicePipelines {
    fn build(service: &ServiceDef) -> GatewayResult<Self> {
        let by_direction = Conversion::ALL
            .iter()
            .map(|c| ConverterPipeline::build(&service.conversion(*c).conversion))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { by_direction })
    }

    fn get(&self, conversion: Conversion) -> Option<&ConverterPipeline> {
        self.by_direction.get(conversion.index())
    }
}

/// Immutable snapshot of one dialect definition plus its compiled pipelines.
#[derive(Debug)]
pub struct FlavorState {
    pub def: FlavorDef,
    pipelines: HashMap<String, ServicePipelines>,
}

impl FlavorState {
    pub fn build(def: FlavorDef) -> GatewayResult<Self> {
        let pipelines = def
            .services
            .iter()
            .map(|(name, service)| Ok((name.clone(), ServicePipelines::build(service)?)))
            .collect::<GatewayResult<HashMap<_, _>>>()?;
        Ok(Self { def, pipelines })
    }
}

/// One route a flavor asks the front door to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub service: String,
    pub method: String,
    pub path: String,
    pub install_raw: bool,
}

#[derive(Debug)]
pub struct Flavor {
    name: String,
    source: DefinitionSource,
    state: ArcSwap<FlavorState>,
}

impl Flavor {
    pub fn new(def: FlavorDef, source: DefinitionSource) -> GatewayResult<Self> {
        let name = def.name.clone();
        let state = FlavorState::build(def)?;
        Ok(Self {
            name,
            source,
            state: ArcSwap::from_pointee(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_canonical(&self) -> bool {
        self.name == CANONICAL_FLAVOR
    }

    /// Current snapshot. Holders keep using it even if a reload happens.
    pub fn state(&self) -> Arc<FlavorState> {
        self.state.load_full()
    }

    /// Re-reads the definition from its source and swaps in freshly built
    /// pipelines. On error the current state stays installed.
    pub fn reload(&self) -> GatewayResult<()> {
        let def = self.source.load(&self.name)?;
        self.replace(def)
    }

    pub fn replace(&self, def: FlavorDef) -> GatewayResult<()> {
        let state = FlavorState::build(def)?;
        self.state.store(Arc::new(state));
        info!(flavor = %self.name, "flavor definition reloaded");
        Ok(())
    }

    pub fn service_def(&self, service: &str) -> Option<ServiceDef> {
        self.state.load().def.services.get(service).cloned()
    }

    pub fn default_model(&self, service: &str) -> Option<String> {
        self.service_def(service)
            .map(|s| s.default_model)
            .filter(|m| !m.is_empty())
    }

    pub fn stream_prologue(&self, service: &str) -> Vec<String> {
        self.service_def(service)
            .map(|s| s.stream_response_from_canonical.prologue)
            .unwrap_or_default()
    }

    pub fn stream_epilogue(&self, service: &str) -> Vec<String> {
        self.service_def(service)
            .map(|s| s.stream_response_from_canonical.epilogue)
            .unwrap_or_default()
    }

    /// Endpoint templates across all services, in service-name order.
    pub fn routes(&self) -> GatewayResult<Vec<RouteSpec>> {
        let state = self.state.load();
        let mut routes = Vec::new();
        for (service, def) in &state.def.services {
            for (method, path) in def.routes()? {
                routes.push(RouteSpec {
                    service: service.clone(),
                    method,
                    path,
                    install_raw: def.install_raw_routes,
                });
            }
        }
        Ok(routes)
    }

    /// Runs the compiled pipeline for `(service, conversion)`. A service the
    /// flavor does not declare has no steps, which is the identity.
    pub fn convert(
        &self,
        service: &str,
        conversion: Conversion,
        content: &HttpContent,
        ctx: &ConvertContext,
    ) -> GatewayResult<HttpContent> {
        let state = self.state.load();
        match state.pipelines.get(service).and_then(|p| p.get(conversion)) {
            Some(pipeline) => {
                debug!(flavor = %self.name, service, %conversion, steps = pipeline.len(), "converting");
                pipeline.convert(content, ctx)
            }
            None => Ok(content.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flavor(yaml: &str) -> Flavor {
        let def = FlavorDef::from_yaml("sample", yaml).unwrap();
        Flavor::new(def, DefinitionSource::Builtin).unwrap()
    }

    const SAMPLE: &str = r#"
name: sample
services:
  chat:
    endpoints: ["POST /v1/chat"]
    install_raw_routes: true
    request_to_canonical:
      conversion:
        - converter: json_map
          config:
            fields: [{to: /from_sample, value: true}]
"#;

    #[test]
    fn test_convert_runs_service_pipeline() {
        let f = flavor(SAMPLE);
        let out = f
            .convert(
                "chat",
                Conversion::RequestToCanonical,
                &HttpContent::from_body("{}"),
                &ConvertContext::new(),
            )
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body, json!({"from_sample": true}));
    }

    #[test]
    fn test_unknown_service_is_identity() {
        let f = flavor(SAMPLE);
        let input = HttpContent::from_body("raw");
        let out = f
            .convert("embed", Conversion::RequestToCanonical, &input, &ConvertContext::new())
            .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_replace_keeps_old_snapshot_valid() {
        let f = flavor(SAMPLE);
        let before = f.state();
        let mut def = before.def.clone();
        def.services.get_mut("chat").unwrap().request_to_canonical.conversion.clear();
        f.replace(def).unwrap();

        // the old snapshot still has its pipeline
        assert!(!before.pipelines["chat"].get(Conversion::RequestToCanonical).unwrap().is_empty());
        // new requests see the new one
        let input = HttpContent::from_body("{}");
        let out = f
            .convert("chat", Conversion::RequestToCanonical, &input, &ConvertContext::new())
            .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_failed_replace_keeps_current_state() {
        let f = flavor(SAMPLE);
        let mut def = f.state().def.clone();
        def.services
            .get_mut("chat")
            .unwrap()
            .request_to_canonical
            .conversion
            .push(crate::convert::StepDef {
                converter: "bogus".into(),
                config: serde_json::Value::Null,
            });
        assert!(f.replace(def).is_err());
        assert_eq!(f.state().def.services["chat"].request_to_canonical.conversion.len(), 1);
    }

    #[test]
    fn test_routes() {
        let f = flavor(SAMPLE);
        let routes = f.routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].method, "POST");
        assert_eq!(routes[0].path, "/v1/chat");
        assert!(routes[0].install_raw);
    }
}
