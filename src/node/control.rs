//! Control nodes: vertices that drive device outputs and other pipelines.

use async_trait::async_trait;
use tracing::debug;

use crate::sample::Value;

use super::{Behavior, Input, NodeCore, NodeError, Output, SetupCtx};

/// Target addressing shared by digital and analog outputs.
struct ControlTarget {
    device: String,
    value_name: String,
}

impl ControlTarget {
    fn from_ctx(core: &NodeCore, ctx: &SetupCtx) -> Result<Self, NodeError> {
        Ok(Self {
            device: ctx.require_str(&core.name, "control_target")?,
            value_name: ctx.require_str(&core.name, "control_value")?,
        })
    }

    /// Emit `set <control_value> <value>` to the owning device. Silent
    /// pipelines don't drive outputs; `force` (error/shutdown fallback)
    /// does regardless.
    async fn set_output(
        &self,
        core: &NodeCore,
        value: &Value,
        force: bool,
    ) -> Result<(), NodeError> {
        debug!(
            "Setting {} {} to {}",
            self.device, self.value_name, value
        );
        if core.is_silent && !force {
            return Ok(());
        }
        core.services
            .send_command(&self.device, &format!("set {} {}", self.value_name, value))
            .await?;
        Ok(())
    }

    /// Re-assert the configured default output, if there is one.
    async fn assert_default(&self, core: &NodeCore) {
        if let Some(value) = core.config.get("default_output") {
            let value = json_to_value(value);
            if let Err(e) = self.set_output(core, &value, true).await {
                tracing::error!("{} could not assert default output: {}", core.name, e);
            }
        }
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or_default())),
        other => Value::Text(other.as_str().unwrap_or_default().to_string()),
    }
}

/// Drives a digital output. The logic sits upstream; this node only relays
/// the decision. One-input mode forwards the bit; two-input mode is
/// set-dominant: the first input sets, otherwise the second clears.
#[derive(Default)]
pub struct DigitalControl {
    target: Option<ControlTarget>,
    one_input: bool,
}

#[async_trait]
impl Behavior for DigitalControl {
    fn kind(&self) -> &'static str {
        "DigitalControlNode"
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.target = Some(ControlTarget::from_ctx(core, ctx)?);
        self.one_input = ctx.opt_bool("one_input") || core.inputs().len() < 2;
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))?;
        let sample = input.newest();
        if self.one_input {
            let field = core.input()?;
            let value = sample
                .get(field)
                .ok_or_else(|| NodeError::MissingField(field.to_string()))?;
            target.set_output(core, value, false).await?;
        } else {
            let inputs = core.inputs();
            let on = sample
                .get(&inputs[0])
                .ok_or_else(|| NodeError::MissingField(inputs[0].clone()))?;
            let off = sample
                .get(&inputs[1])
                .ok_or_else(|| NodeError::MissingField(inputs[1].clone()))?;
            if on.is_truthy() {
                target.set_output(core, &Value::Int(1), false).await?;
            } else if off.is_truthy() {
                target.set_output(core, &Value::Int(0), false).await?;
            }
        }
        Ok(Output::Nothing)
    }

    async fn on_error(&mut self, core: &mut NodeCore) {
        if let Some(target) = &self.target {
            target.assert_default(core).await;
        }
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(target) = &self.target {
            target.assert_default(core).await;
        }
    }
}

/// Drives an analog output, clamped to the optional
/// `[min_output, max_output]` window.
#[derive(Default)]
pub struct AnalogControl {
    target: Option<ControlTarget>,
}

#[async_trait]
impl Behavior for AnalogControl {
    fn kind(&self) -> &'static str {
        "AnalogControlNode"
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.target = Some(ControlTarget::from_ctx(core, ctx)?);
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))?;
        let mut value = core.field_f64(input.newest(), core.input()?)?;
        if let Some(min_output) = core.config_f64("min_output") {
            value = value.max(min_output);
        }
        if let Some(max_output) = core.config_f64("max_output") {
            value = value.min(max_output);
        }
        target.set_output(core, &Value::Float(value), false).await?;
        Ok(Output::Nothing)
    }

    async fn on_error(&mut self, core: &mut NodeCore) {
        if let Some(target) = &self.target {
            target.assert_default(core).await;
        }
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(target) = &self.target {
            target.assert_default(core).await;
        }
    }
}

/// Lets one pipeline start, stop, restart or silence others. The `actions`
/// table maps condition fields to `[action, pipeline]` pairs; commands are
/// routed to the monitor owning the pipeline's flavor.
#[derive(Default)]
pub struct PipelineControl {
    actions: Vec<(String, Vec<(String, String)>)>,
}

fn monitor_for(pipeline: &str) -> Result<&'static str, NodeError> {
    if pipeline.starts_with("control") || pipeline.starts_with("test") {
        Ok("pl_control")
    } else if pipeline.starts_with("alarm") {
        Ok("pl_alarm")
    } else if pipeline.starts_with("convert") {
        Ok("pl_convert")
    } else {
        Err(NodeError::Other(format!(
            "don't know which monitor owns pipeline '{}'",
            pipeline
        )))
    }
}

#[async_trait]
impl Behavior for PipelineControl {
    fn kind(&self) -> &'static str {
        "PipelineControlNode"
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        let table = ctx.options.get("actions").cloned().ok_or_else(|| {
            NodeError::MissingParam(core.name.clone(), "actions".to_string())
        })?;
        let table: std::collections::BTreeMap<String, Vec<(String, String)>> =
            serde_json::from_value(table).map_err(|e| {
                NodeError::BadParam(core.name.clone(), "actions".to_string(), e.to_string())
            })?;
        self.actions = table.into_iter().collect();
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        if core.is_silent {
            return Ok(Output::Nothing);
        }
        let sample = input.newest();
        for (condition, actions) in &self.actions {
            if !sample.get(condition).is_some_and(Value::is_truthy) {
                continue;
            }
            for (action, pipeline) in actions {
                let to = monitor_for(pipeline)?;
                debug!("Sending {} to {}", action, pipeline);
                core.services
                    .send_command(to, &format!("pipelinectl_{} {}", action, pipeline))
                    .await?;
            }
        }
        Ok(Output::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_routing_by_prefix() {
        assert_eq!(monitor_for("control_valve").unwrap(), "pl_control");
        assert_eq!(monitor_for("test_pipeline").unwrap(), "pl_control");
        assert_eq!(monitor_for("alarm_pressure").unwrap(), "pl_alarm");
        assert_eq!(monitor_for("convert_pressure").unwrap(), "pl_convert");
        assert!(monitor_for("mystery_pipeline").is_err());
    }

    #[test]
    fn test_json_value_conversion() {
        assert_eq!(json_to_value(&serde_json::json!(1)), Value::Int(1));
        assert_eq!(json_to_value(&serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(json_to_value(&serde_json::json!(true)), Value::Bool(true));
    }
}
