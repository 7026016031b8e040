use tracing::trace;

use super::steps::{ConversionStep, StepDef};
use crate::error::GatewayResult;
use crate::types::{ConvertContext, HttpContent};

/// Ordered, immutable list of compiled steps for one (service, direction).
/// An empty pipeline is the identity transform.
#[derive(Debug, Clone, Default)]
pub struct ConverterPipeline {
    steps: Vec<ConversionStep>,
}

impl ConverterPipeline {
    pub fn build(defs: &[StepDef]) -> GatewayResult<Self> {
        let steps = defs
            .iter()
            .map(ConversionStep::build)
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn convert(&self, content: &HttpContent, ctx: &ConvertContext) -> GatewayResult<HttpContent> {
        let Some((first, rest)) = self.steps.split_first() else {
            return Ok(content.clone());
        };
        let mut current = first.apply(content, ctx)?;
        for step in rest {
            trace!(step = step.name(), "applying conversion step");
            current = step.apply(&current, ctx)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defs(value: serde_json::Value) -> Vec<StepDef> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let p = ConverterPipeline::build(&[]).unwrap();
        assert!(p.is_empty());
        let input = HttpContent::from_body("anything, not even json");
        assert_eq!(p.convert(&input, &ConvertContext::new()).unwrap(), input);
    }

    #[test]
    fn test_steps_run_in_order() {
        let p = ConverterPipeline::build(&defs(json!([
            {"converter": "json_map", "config": {"fields": [{"to": "/stream", "value": true}]}},
            {"converter": "stream_flag", "config": {"path": "/stream"}}
        ])))
        .unwrap();
        assert_eq!(p.len(), 2);
        let out = p
            .convert(&HttpContent::from_body("{}"), &ConvertContext::new().with("stream", false))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body, json!({"stream": false}));
    }

    #[test]
    fn test_failure_aborts_pipeline() {
        let p = ConverterPipeline::build(&defs(json!([
            {"converter": "drop_if", "config": {"body_equals": "[DONE]"}},
            {"converter": "json_map", "config": {"fields": [{"to": "/x", "value": 1}]}}
        ])))
        .unwrap();
        let err = p
            .convert(&HttpContent::from_body("[DONE]"), &ConvertContext::new())
            .unwrap_err();
        assert!(err.is_drop());
    }

    #[test]
    fn test_unknown_step_fails_build() {
        let result = ConverterPipeline::build(&defs(json!([{"converter": "nope"}])));
        assert!(result.is_err());
    }
}
