//! Pipeline graph vertices.
//!
//! A node is a [`NodeCore`] (name, wiring, buffered history, runtime
//! config) paired with a boxed [`Behavior`] implementing its semantics.
//! Behaviors are instantiated from the node spec's `type` string through an
//! explicit registry; unknown type names fail the pipeline build.
//!
//! Nodes depend on the hosting process only through [`Services`]: metrics
//! write, config-store access, alarm delivery, command sending and the data
//! publisher.

pub mod alarm;
pub mod buffer;
pub mod control;
pub mod sink;
pub mod source;
pub mod transform;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::bus::{BusError, CommandEnvelope, CommandSender, DataPublisher};
use crate::config::{AlarmConfigDoc, Document, InfluxDoc, InputVar, SensorDoc};
use crate::expr::ExprError;
use crate::metrics::{MetricsError, MetricsSink};
use crate::sample::{Sample, SortedBuffer, Value};
use crate::store::{ConfigStore, ContactAddresses, StoreError};
use crate::util::unix_now;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("buffer of node '{0}' is empty")]
    EmptyBuffer(String),

    #[error("buffer of node '{0}' is not full")]
    BufferNotFull(String),

    #[error("node '{0}' got no new value for '{1}'")]
    NoNewValue(String, String),

    #[error("node '{0}' needs more samples than it has")]
    NotEnoughData(String),

    #[error("package has no field '{0}'")]
    MissingField(String),

    #[error("field '{0}' is not numeric")]
    NotNumeric(String),

    #[error("node '{0}' is missing required parameter '{1}'")]
    MissingParam(String, String),

    #[error("node '{0}' has a bad '{1}' parameter: {2}")]
    BadParam(String, String, String),

    #[error("alarm delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("{0}")]
    Other(String),
}

/// Failure to hand an alarm to any configured channel.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("no delivery channels configured")]
    NoChannels,

    #[error("this monitor does not deliver alarms")]
    NotSupported,

    #[error("{0}")]
    Provider(String),
}

/// An alarm on its way out of the system.
#[derive(Debug, Clone)]
pub struct AlarmMessage {
    pub level: i64,
    pub message: String,
    pub pipeline: String,
    pub hash: Option<String>,
    /// Explicit protocol→addresses routing; when unset, recipients are
    /// resolved from the alarm config for `level`.
    pub routing: Option<ContactAddresses>,
}

/// Delivery seam implemented by the alarm monitor. Other monitors plug in
/// a refusing implementation.
#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn log_alarm(&self, alarm: AlarmMessage) -> Result<(), DeliveryError>;
}

/// An [`AlarmSink`] for monitors that cannot deliver anything.
pub struct NoAlarmSink;

#[async_trait]
impl AlarmSink for NoAlarmSink {
    async fn log_alarm(&self, _alarm: AlarmMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotSupported)
    }
}

/// Shared services a pipeline hands to each of its nodes.
pub struct Services {
    pub experiment: String,
    pub pipeline_name: String,
    pub store: Arc<dyn ConfigStore>,
    pub metrics: Arc<MetricsSink>,
    pub alarms: Arc<dyn AlarmSink>,
    pub commands: Arc<CommandSender>,
    pub data: Arc<DataPublisher>,
    /// Level at which the pipeline was last silenced; -1 is universal.
    silenced_at_level: AtomicI64,
}

impl Services {
    pub fn new(
        experiment: impl Into<String>,
        pipeline_name: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        metrics: Arc<MetricsSink>,
        alarms: Arc<dyn AlarmSink>,
        commands: Arc<CommandSender>,
        data: Arc<DataPublisher>,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            pipeline_name: pipeline_name.into(),
            store,
            metrics,
            alarms,
            commands,
            data,
            silenced_at_level: AtomicI64::new(0),
        }
    }

    pub fn silenced_at_level(&self) -> i64 {
        self.silenced_at_level.load(Ordering::Acquire)
    }

    pub fn set_silenced_at_level(&self, level: i64) {
        self.silenced_at_level.store(level, Ordering::Release);
    }

    /// Silence the owning pipeline for `duration` seconds at `level`
    /// (-1 = universal).
    pub async fn silence_for(&self, duration: f64, level: i64) -> Result<(), StoreError> {
        let until = unix_now() + duration;
        self.store
            .set_pipeline_values(&self.pipeline_name, &[("silent_until", until.into())])
            .await?;
        self.set_silenced_at_level(level);
        Ok(())
    }

    /// Queue a command for another worker through the broker.
    pub async fn send_command(&self, to: &str, command: &str) -> Result<(), BusError> {
        self.commands
            .envelope(&CommandEnvelope {
                to: to.to_string(),
                time: unix_now(),
                from: self.pipeline_name.clone(),
                command: command.to_string(),
            })
            .await
    }
}

/// What a node's `process` step receives.
#[derive(Debug, Clone)]
pub enum Input {
    /// The freshest buffered (or freshly acquired) sample.
    Newest(Sample),
    /// A copy of the whole buffer, oldest first.
    Buffer(Vec<Sample>),
}

impl Input {
    pub fn newest(&self) -> &Sample {
        match self {
            Input::Newest(s) => s,
            // acquire() never builds an empty buffer input
            Input::Buffer(v) => v.last().expect("buffer input is never empty"),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        match self {
            Input::Newest(s) => std::slice::from_ref(s),
            Input::Buffer(v) => v,
        }
    }
}

/// What a node's `process` step returns.
#[derive(Debug, Clone)]
pub enum Output {
    /// Pass the input sample through unchanged.
    Nothing,
    /// Replace the downstream package entirely.
    Replace(Sample),
    /// Write this value to the node's output field on the freshest sample.
    Scalar(Value),
}

/// Which sensor document a node kind is bound to at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorBinding {
    None,
    /// The sensor named by `input_var`.
    Input,
    /// The sensor named by `output_var` (falling back to `input_var`).
    Output,
}

/// Everything a behavior needs during one-time setup.
pub struct SetupCtx {
    /// Node-spec options merged with the well-known fields of the bound
    /// sensor document.
    pub options: Document,
    pub sensor: Option<SensorDoc>,
    pub influx: InfluxDoc,
    pub alarm: AlarmConfigDoc,
}

impl SetupCtx {
    pub fn opt_str(&self, key: &str) -> Option<String> {
        self.options
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn opt_bool(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn require_str(&self, node: &str, key: &str) -> Result<String, NodeError> {
        self.opt_str(key)
            .ok_or_else(|| NodeError::MissingParam(node.to_string(), key.to_string()))
    }
}

/// Common node state.
pub struct NodeCore {
    pub name: String,
    pub input_var: Option<InputVar>,
    pub output_var: Option<String>,
    pub upstream: Vec<String>,
    pub buffer: SortedBuffer,
    pub config: Document,
    pub is_silent: bool,
    pub services: Arc<Services>,
}

impl NodeCore {
    pub fn new(
        name: impl Into<String>,
        input_var: Option<InputVar>,
        output_var: Option<String>,
        upstream: Vec<String>,
        services: Arc<Services>,
    ) -> Self {
        // output defaults to the (single) input name
        let output_var = output_var.or_else(|| {
            input_var
                .as_ref()
                .and_then(|iv| iv.single().map(str::to_string))
        });
        Self {
            name: name.into(),
            input_var,
            output_var,
            upstream,
            buffer: SortedBuffer::new(1),
            config: Document::new(),
            is_silent: true,
            services,
        }
    }

    /// The single input field name; errors when absent or a list.
    pub fn input(&self) -> Result<&str, NodeError> {
        self.input_var
            .as_ref()
            .and_then(|iv| iv.single())
            .ok_or_else(|| NodeError::MissingParam(self.name.clone(), "input_var".to_string()))
    }

    pub fn inputs(&self) -> Vec<String> {
        self.input_var
            .as_ref()
            .map(InputVar::names)
            .unwrap_or_default()
    }

    pub fn output(&self) -> Result<&str, NodeError> {
        self.output_var
            .as_deref()
            .ok_or_else(|| NodeError::MissingParam(self.name.clone(), "output_var".to_string()))
    }

    // --- runtime-config readers ---

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        let value = self.config.get(key)?;
        value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }

    pub fn config_i64(&self, key: &str) -> Option<i64> {
        let value = self.config.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }

    pub fn config_usize(&self, key: &str) -> Option<usize> {
        self.config_i64(key).and_then(|i| usize::try_from(i).ok())
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, NodeError> {
        self.config_f64(key)
            .ok_or_else(|| NodeError::MissingParam(self.name.clone(), key.to_string()))
    }

    pub fn require_i64(&self, key: &str) -> Result<i64, NodeError> {
        self.config_i64(key)
            .ok_or_else(|| NodeError::MissingParam(self.name.clone(), key.to_string()))
    }

    /// Numeric value of the named field on a sample.
    pub fn field_f64(&self, sample: &Sample, field: &str) -> Result<f64, NodeError> {
        let value = sample
            .get(field)
            .ok_or_else(|| NodeError::MissingField(field.to_string()))?;
        value
            .as_f64()
            .ok_or_else(|| NodeError::NotNumeric(field.to_string()))
    }

    /// Numeric values of this node's input field over a run of samples.
    pub fn input_series(&self, samples: &[Sample]) -> Result<Vec<f64>, NodeError> {
        let field = self.input()?;
        samples
            .iter()
            .map(|s| self.field_f64(s, field))
            .collect()
    }
}

/// The semantics of one node kind.
#[async_trait]
pub trait Behavior: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Whether `process` receives the whole buffer instead of the freshest
    /// sample.
    fn uses_buffer(&self) -> bool {
        false
    }

    /// Buffer nodes with this set refuse to run before the buffer is full.
    fn strict(&self) -> bool {
        false
    }

    /// Sources get a retry drift when their cycle fails.
    fn is_source(&self) -> bool {
        false
    }

    /// Stream sources fed by the data bus (classify the pipeline as sync).
    fn is_sync_source(&self) -> bool {
        false
    }

    /// Whether the owning pipeline must see a fresh sample for this node's
    /// input before cycling (decided during setup).
    fn requires_fresh(&self) -> bool {
        false
    }

    /// Merge nodes are excluded from the startup-cycle estimate.
    fn is_merge(&self) -> bool {
        false
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::None
    }

    /// Sensor-document fields copied into the runtime config every cycle.
    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &[]
    }

    async fn setup(&mut self, _core: &mut NodeCore, _ctx: &SetupCtx) -> Result<(), NodeError> {
        Ok(())
    }

    /// Called every cycle before `process`; the default copies the merged
    /// document into the node's runtime config.
    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        core.config = doc.clone();
        Ok(())
    }

    /// Produce the input out-of-band (metrics queries); `None` uses the
    /// buffer.
    async fn acquire(&mut self, _core: &mut NodeCore) -> Result<Option<Input>, NodeError> {
        Ok(None)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError>;

    /// Rewrite a package arriving from upstream before it is buffered.
    fn on_receive(&mut self, _core: &NodeCore, package: Sample) -> Sample {
        package
    }

    /// Housekeeping after the result went downstream.
    fn post_process(&mut self, _core: &mut NodeCore) {}

    /// Fallback invoked on every node of a subpipeline whose cycle failed.
    async fn on_error(&mut self, _core: &mut NodeCore) {}

    async fn shutdown(&mut self, _core: &mut NodeCore) {}
}

/// A wired graph vertex.
pub struct Node {
    pub core: NodeCore,
    pub behavior: Box<dyn Behavior>,
    /// Indices of downstream nodes within the owning pipeline.
    pub downstream: Vec<usize>,
}

impl Node {
    /// One evaluation: acquire input, process, shape the downstream package.
    pub async fn process_base(&mut self, is_silent: bool) -> Result<Sample, NodeError> {
        self.core.is_silent = is_silent;
        let input = match self.behavior.acquire(&mut self.core).await? {
            Some(input) => input,
            None => self.default_input()?,
        };
        let output = self.behavior.process(&mut self.core, &input).await?;
        let package = match output {
            Output::Nothing => input.newest().clone(),
            Output::Replace(sample) => sample,
            Output::Scalar(value) => {
                let mut sample = input.newest().clone();
                let field = self.core.output()?.to_string();
                sample.set(field, value);
                sample
            }
        };
        self.behavior.post_process(&mut self.core);
        Ok(package)
    }

    fn default_input(&self) -> Result<Input, NodeError> {
        if self.behavior.uses_buffer() {
            if self.behavior.strict() && !self.core.buffer.is_full() {
                return Err(NodeError::BufferNotFull(self.core.name.clone()));
            }
            if self.core.buffer.is_empty() {
                return Err(NodeError::EmptyBuffer(self.core.name.clone()));
            }
            Ok(Input::Buffer(self.core.buffer.samples().to_vec()))
        } else {
            self.core
                .buffer
                .newest()
                .cloned()
                .map(Input::Newest)
                .ok_or_else(|| NodeError::EmptyBuffer(self.core.name.clone()))
        }
    }

    /// Insert a package arriving from upstream (or from the data bus).
    pub fn receive(&mut self, package: Sample) {
        let package = self.behavior.on_receive(&self.core, package);
        self.core.buffer.add(package);
    }
}

/// Instantiate a behavior from its configured type name.
pub fn create_behavior(kind: &str) -> Option<Box<dyn Behavior>> {
    Some(match kind {
        "InfluxSourceNode" => Box::new(source::InfluxSource::default()),
        "SensorSourceNode" => Box::new(source::SensorSource::default()),
        "PipelineSourceNode" => Box::new(source::PipelineSource::default()),
        "MedianFilterNode" => Box::new(buffer::MedianFilter::default()),
        "MergeNode" => Box::new(buffer::Merge::default()),
        "IntegralNode" => Box::new(buffer::Integral::default()),
        "DerivativeNode" => Box::new(buffer::Derivative::default()),
        "PolynomialNode" => Box::new(transform::Polynomial::default()),
        "EvalNode" => Box::new(transform::Eval::default()),
        "InfluxSinkNode" => Box::new(sink::InfluxSink::default()),
        "TriggeredAlarmsNode" => Box::new(alarm::TriggeredAlarms::default()),
        "SimpleAlarmNode" => Box::new(alarm::SimpleAlarm::default()),
        "IntegerAlarmNode" => Box::new(alarm::IntegerAlarm::default()),
        "BitmaskIntegerAlarmNode" => Box::new(alarm::BitmaskIntegerAlarm::default()),
        "TimeSinceAlarmNode" => Box::new(alarm::TimeSinceAlarm::default()),
        "DeviceRespondingInfluxNode" => Box::new(alarm::DeviceRespondingInflux::default()),
        "DeviceRespondingSyncNode" => Box::new(alarm::DeviceRespondingSync::default()),
        "CheckRemoteHeartbeatNode" => Box::new(alarm::CheckRemoteHeartbeat::default()),
        "DigitalControlNode" => Box::new(control::DigitalControl::default()),
        "AnalogControlNode" => Box::new(control::AnalogControl::default()),
        "PipelineControlNode" => Box::new(control::PipelineControl::default()),
        _ => return None,
    })
}

/// Map of numeric input fields for expression evaluation.
pub fn numeric_fields(sample: &Sample, names: &[String]) -> Result<BTreeMap<String, f64>, NodeError> {
    let mut out = BTreeMap::new();
    for name in names {
        let value = sample
            .get(name)
            .ok_or_else(|| NodeError::MissingField(name.clone()))?;
        let number = value
            .as_f64()
            .ok_or_else(|| NodeError::NotNumeric(name.clone()))?;
        out.insert(name.clone(), number);
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::sync::Mutex;

    /// Records alarms instead of delivering them.
    #[derive(Default)]
    pub struct RecordingSink {
        pub delivered: Mutex<Vec<AlarmMessage>>,
    }

    #[async_trait]
    impl AlarmSink for RecordingSink {
        async fn log_alarm(&self, alarm: AlarmMessage) -> Result<(), DeliveryError> {
            self.delivered.lock().await.push(alarm);
            Ok(())
        }
    }

    pub fn test_services_with(
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        pipeline: &str,
    ) -> Arc<Services> {
        let influx: InfluxDoc = serde_json::from_value(serde_json::json!({
            "url": "http://localhost:8086", "org": "t", "bucket": "t", "db": "t", "token": "t"
        }))
        .unwrap();
        let metrics = Arc::new(MetricsSink::from_config(&influx, "testing").unwrap());
        Arc::new(Services::new(
            "testing",
            pipeline,
            store,
            metrics,
            sink,
            Arc::new(CommandSender::new("127.0.0.1", 1)),
            Arc::new(DataPublisher::new("127.0.0.1", 1)),
        ))
    }
}
