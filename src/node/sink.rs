//! Sink nodes: vertices that write values out of a graph.

use async_trait::async_trait;

use crate::bus::DataMessage;

use super::{Behavior, Input, NodeCore, NodeError, Output, SensorBinding, SetupCtx};

/// Writes the input value to the metrics store and rebroadcasts it on the
/// data bus, so sync pipelines can chain off converted values.
#[derive(Default)]
pub struct InfluxSink {
    topic: String,
    subsystem: String,
    device: String,
}

#[async_trait]
impl Behavior for InfluxSink {
    fn kind(&self) -> &'static str {
        "InfluxSinkNode"
    }

    fn sensor_binding(&self) -> SensorBinding {
        // the sink is bound to the sensor it writes, not the one it reads
        SensorBinding::Output
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        let sensor = ctx.sensor.as_ref().ok_or_else(|| {
            NodeError::MissingParam(core.name.clone(), "output sensor".to_string())
        })?;
        self.topic = sensor.topic.clone();
        self.subsystem = sensor.subsystem.clone();
        self.device = sensor.device.clone();
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        if core.is_silent {
            return Ok(Output::Nothing);
        }
        let sample = input.newest();
        let output = core.output()?.to_string();
        let field = core.input()?.to_string();
        let value = sample
            .get(&field)
            .ok_or(NodeError::MissingField(field))?
            .clone();
        core.services
            .metrics
            .write(
                &self.topic,
                &[
                    ("sensor", output.as_str()),
                    ("device", self.device.as_str()),
                    ("subsystem", self.subsystem.as_str()),
                ],
                &[("value", value.clone())],
                sample.time,
            )
            .await?;
        core.services
            .data
            .publish(&DataMessage {
                name: output,
                time: sample.time,
                value,
            })
            .await?;
        Ok(Output::Nothing)
    }
}
