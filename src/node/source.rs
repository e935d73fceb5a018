//! Source nodes: vertices that bring data into a graph from outside.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::config::SYNC_PREFIX;
use crate::metrics::LastValueQuery;
use crate::sample::Sample;
use crate::util::unix_now;

use super::{Behavior, Input, NodeCore, NodeError, Output, SensorBinding, SetupCtx};

/// Shared last-value polling state for metrics-backed sources.
pub(crate) struct MetricsPull {
    query: LastValueQuery,
    client: Client,
    pub accept_old: bool,
    last_time: i64,
}

impl MetricsPull {
    pub fn from_ctx(core: &NodeCore, ctx: &SetupCtx, accept_old: bool) -> Result<Self, NodeError> {
        let input = core.input()?;
        if input.starts_with(SYNC_PREFIX) {
            return Err(NodeError::BadParam(
                core.name.clone(),
                "input_var".to_string(),
                "sync signals are not recorded in the metrics store".to_string(),
            ));
        }
        let topic = ctx
            .sensor
            .as_ref()
            .map(|s| s.topic.clone())
            .filter(|t| !t.is_empty())
            .or_else(|| ctx.opt_str("topic"))
            .ok_or_else(|| NodeError::MissingParam(core.name.clone(), "topic".to_string()))?;
        let query = LastValueQuery::new(&ctx.influx, &topic, input)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NodeError::Other(e.to_string()))?;
        Ok(Self {
            query,
            client,
            accept_old,
            last_time: 0,
        })
    }

    /// Fetch the latest sample, retrying once when the timestamp hasn't
    /// moved (a fresh value may land within a few ms of the query).
    pub async fn pull(&mut self, core: &NodeCore) -> Result<Sample, NodeError> {
        let (mut timestamp, mut value) = self.query.fetch(&self.client).await?;
        if timestamp == self.last_time && !self.accept_old {
            (timestamp, value) = self.query.fetch(&self.client).await?;
            if timestamp == self.last_time {
                return Err(NodeError::NoNewValue(
                    core.name.clone(),
                    core.input()?.to_string(),
                ));
            }
        }
        self.last_time = timestamp;
        debug!("{} time {} value {}", core.name, timestamp, value);
        let sample = Sample::new(timestamp as f64 * 1e-9).with(core.output()?, value);
        Ok(sample)
    }
}

/// Polls the metrics store for the latest value of `input_var`.
#[derive(Default)]
pub struct InfluxSource {
    pull: Option<MetricsPull>,
}

#[async_trait]
impl Behavior for InfluxSource {
    fn kind(&self) -> &'static str {
        "InfluxSourceNode"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        let accept_old = ctx.opt_bool("accept_old");
        self.pull = Some(MetricsPull::from_ctx(core, ctx, accept_old)?);
        Ok(())
    }

    async fn acquire(&mut self, core: &mut NodeCore) -> Result<Option<Input>, NodeError> {
        let pull = self
            .pull
            .as_mut()
            .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))?;
        Ok(Some(Input::Newest(pull.pull(core).await?)))
    }

    async fn process(&mut self, _core: &mut NodeCore, _input: &Input) -> Result<Output, NodeError> {
        Ok(Output::Nothing)
    }
}

/// Receives samples for one sensor directly from the data bus.
#[derive(Default)]
pub struct SensorSource {
    fresh_required: bool,
}

#[async_trait]
impl Behavior for SensorSource {
    fn kind(&self) -> &'static str {
        "SensorSourceNode"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn is_sync_source(&self) -> bool {
        true
    }

    fn requires_fresh(&self) -> bool {
        self.fresh_required
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.fresh_required =
            ctx.opt_bool("new_value_required") || core.input()?.starts_with(SYNC_PREFIX);
        Ok(())
    }

    fn on_receive(&mut self, core: &NodeCore, mut package: Sample) -> Sample {
        if let (Ok(input), Ok(output)) = (core.input(), core.output()) {
            let (input, output) = (input.to_string(), output.to_string());
            package.rename(&input, &output);
        }
        package
    }

    async fn process(&mut self, _core: &mut NodeCore, _input: &Input) -> Result<Output, NodeError> {
        Ok(Output::Nothing)
    }
}

/// Emits the status document of another pipeline; `input_var` names it.
#[derive(Default)]
pub struct PipelineSource;

#[async_trait]
impl Behavior for PipelineSource {
    fn kind(&self) -> &'static str {
        "PipelineSourceNode"
    }

    fn is_source(&self) -> bool {
        true
    }

    async fn acquire(&mut self, core: &mut NodeCore) -> Result<Option<Input>, NodeError> {
        let name = core.input()?.to_string();
        let stats = core.services.store.get_pipeline_stats(&name).await?;
        let sample = Sample::new(unix_now())
            .with("status", stats.status.as_str())
            .with("cycles", stats.cycles as i64)
            .with("error", stats.error)
            .with("rate", stats.rate);
        Ok(Some(Input::Newest(sample)))
    }

    async fn process(&mut self, _core: &mut NodeCore, _input: &Input) -> Result<Output, NodeError> {
        Ok(Output::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputVar;
    use crate::node::testutil::{test_services_with, RecordingSink};
    use crate::store::{Collections, ConfigStore, MemoryStore};
    use std::sync::Arc;

    fn core_for(input: &str) -> NodeCore {
        let store = Arc::new(MemoryStore::new());
        let services = test_services_with(store, Arc::new(RecordingSink::default()), "convert_t");
        NodeCore::new(
            "src",
            Some(InputVar::One(input.to_string())),
            None,
            vec![],
            services,
        )
    }

    #[tokio::test]
    async fn test_sensor_source_renames_on_receive() {
        let mut core = core_for("pressure_raw");
        core.output_var = Some("pressure".to_string());
        let mut behavior = SensorSource::default();
        let package = Sample::new(5.0).with("pressure_raw", 1.5);
        let received = behavior.on_receive(&core, package);
        assert_eq!(received.get_f64("pressure"), Some(1.5));
        assert!(received.get("pressure_raw").is_none());
    }

    #[tokio::test]
    async fn test_sensor_source_sync_requires_fresh() {
        let mut core = core_for("X_SYNC_5");
        let mut behavior = SensorSource::default();
        let ctx = SetupCtx {
            options: Default::default(),
            sensor: None,
            influx: serde_json::from_value(serde_json::json!({"url": "http://x"})).unwrap(),
            alarm: serde_yaml::from_str(
                "{protocols: [[sms]], recipients: [[shifters]], silence_duration: [60], silence_duration_cant_send: 30, escalation_config: [3]}",
            )
            .unwrap(),
        };
        behavior.setup(&mut core, &ctx).await.unwrap();
        assert!(behavior.requires_fresh());
    }

    #[tokio::test]
    async fn test_pipeline_source_reads_stats() {
        let mut collections = Collections::default();
        collections.pipelines.push(
            serde_json::from_value(serde_json::json!({
                "name": "convert_other", "status": "active", "cycles": 41, "error": -1, "rate": 2.5
            }))
            .unwrap(),
        );
        let store = Arc::new(MemoryStore::from_collections(collections));
        let services =
            test_services_with(store.clone(), Arc::new(RecordingSink::default()), "c");
        let mut core = NodeCore::new(
            "stats",
            Some(InputVar::One("convert_other".to_string())),
            None,
            vec![],
            services,
        );
        let mut behavior = PipelineSource;
        let input = behavior.acquire(&mut core).await.unwrap().unwrap();
        let sample = input.newest();
        assert_eq!(sample.get_f64("cycles"), Some(41.0));
        assert_eq!(sample.get("status").unwrap().to_string(), "active");
        // unknown pipeline surfaces a store error
        core.input_var = Some(InputVar::One("missing".to_string()));
        assert!(behavior.acquire(&mut core).await.is_err());
        let _ = store.get_pipeline("convert_other").await.unwrap();
    }
}
