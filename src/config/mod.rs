//! Typed configuration documents.
//!
//! These are the documents the framework reads from and writes to the
//! experiment's document store: sensors, devices, hosts, pipelines, the
//! hypervisor record, the alarm-system record and the contact list. Field
//! names follow the store schema, so everything round-trips through serde.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A free-form runtime configuration document (node kwargs, node_config
/// sections and the like).
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Prefix of the synthetic heartbeat sensors the hypervisor publishes.
pub const SYNC_PREFIX: &str = "X_SYNC_";

// ============================================================================
// Sensors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Online,
    Offline,
}

impl Default for SensorStatus {
    fn default() -> Self {
        Self::Offline
    }
}

/// One sensor (or control output) hosted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDoc {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default)]
    pub units: String,
    #[serde(default = "default_readout_interval")]
    pub readout_interval: f64,
    #[serde(default)]
    pub status: SensorStatus,
    #[serde(default)]
    pub pipelines: Vec<String>,
    /// `[low, high]` bracket for threshold alarms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_thresholds: Option<[f64; 2]>,
    /// `{integer-as-string: message}` for status-code alarms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_values: Option<BTreeMap<String, String>>,
    /// Single trigger value for time-since alarms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_recurrence: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_level: Option<i64>,
    #[serde(default)]
    pub alarm_is_triggered: bool,
    #[serde(default)]
    pub readout_command: String,
    /// Little-endian polynomial applied by the device readout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_xform: Option<Vec<f64>>,
}

fn default_readout_interval() -> f64 {
    10.0
}

impl SensorDoc {
    /// A bare sensor record with defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            device: String::new(),
            topic: String::new(),
            subsystem: String::new(),
            units: String::new(),
            readout_interval: default_readout_interval(),
            status: SensorStatus::Offline,
            pipelines: Vec::new(),
            alarm_thresholds: None,
            alarm_values: None,
            alarm_value: None,
            alarm_recurrence: None,
            alarm_level: None,
            alarm_is_triggered: false,
            readout_command: String::new(),
            value_xform: None,
        }
    }

    /// The synthetic sensor backing a sync signal of the given period.
    pub fn sync_signal(period: u64) -> Self {
        let mut doc = Self::named(format!("{}{}", SYNC_PREFIX, period));
        doc.description = "Sync signal".to_string();
        doc.readout_interval = period as f64;
        doc.topic = "other".to_string();
        doc.subsystem = "sync".to_string();
        doc.device = "hypervisor".to_string();
        doc
    }
}

// ============================================================================
// Pipelines
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Active,
    Silent,
    Inactive,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Active => "active",
            PipelineStatus::Silent => "silent",
            PipelineStatus::Inactive => "inactive",
        }
    }
}

/// One vertex of a pipeline graph as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_var: Option<InputVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    /// Remaining node-specific setup parameters.
    #[serde(flatten)]
    pub options: Document,
}

/// `input_var` is a single field name for most nodes, a list for fan-in
/// nodes like computed expressions or two-bit digital controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputVar {
    One(String),
    Many(Vec<String>),
}

impl InputVar {
    /// The single name, when there is exactly one.
    pub fn single(&self) -> Option<&str> {
        match self {
            InputVar::One(s) => Some(s),
            InputVar::Many(v) if v.len() == 1 => Some(&v[0]),
            InputVar::Many(_) => None,
        }
    }

    pub fn names(&self) -> Vec<String> {
        match self {
            InputVar::One(s) => vec![s.clone()],
            InputVar::Many(v) => v.clone(),
        }
    }
}

/// A configured processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDoc {
    pub name: String,
    #[serde(default)]
    pub status: PipelineStatus,
    /// Unix seconds until which the pipeline is silent; -1 means silenced
    /// indefinitely.
    #[serde(default)]
    pub silent_until: f64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pipeline: Vec<NodeSpec>,
    /// Runtime configuration: the `general` section applies to every node,
    /// a section named after a node applies to that node only.
    #[serde(default)]
    pub node_config: BTreeMap<String, Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycles: u64,
    /// Cycle number of the most recent error, -1 if none.
    #[serde(default = "default_error")]
    pub error: i64,
    /// Total node-processing time of the last cycle, in milliseconds.
    #[serde(default)]
    pub rate: f64,
}

fn default_error() -> i64 {
    -1
}

/// The slice of a pipeline document other pipelines may observe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub status: PipelineStatus,
    pub cycles: u64,
    pub error: i64,
    pub rate: f64,
}

// ============================================================================
// Devices and hosts
// ============================================================================

/// A device process: where it runs and which sensors it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDoc {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Multi-sensor devices emit several fields per sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDoc {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    /// Devices that run on this host by default.
    #[serde(default)]
    pub default: Vec<String>,
}

// ============================================================================
// Hypervisor
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortPair {
    pub send: u16,
    pub recv: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommsDoc {
    pub data: PortPair,
    pub command: PortPair,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessLists {
    #[serde(default)]
    pub managed: Vec<String>,
    #[serde(default)]
    pub active: Vec<String>,
}

/// Destination for the dead-man's-switch file on a paired experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHeartbeatDoc {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_remote_directory")]
    pub directory: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_directory() -> String {
    "/scratch".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorDoc {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Directory holding the process-launch helper script.
    pub path: String,
    #[serde(default = "default_period")]
    pub period: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processes: ProcessLists,
    pub comms: CommsDoc,
    /// Commands run once per host when the hypervisor starts.
    #[serde(default)]
    pub startup_sequence: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub remote_heartbeat: Vec<RemoteHeartbeatDoc>,
    #[serde(default = "default_sync_periods")]
    pub sync_periods: Vec<u64>,
}

fn default_period() -> f64 {
    60.0
}

fn default_sync_periods() -> Vec<u64> {
    vec![5, 10, 15, 30, 60]
}

// ============================================================================
// Alarm system
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Sms,
    Email,
    Phone,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Sms => write!(f, "sms"),
            Protocol::Email => write!(f, "email"),
            Protocol::Phone => write!(f, "phone"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientGroup {
    Shifters,
    Experts,
    Everyone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConnection {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub fromaddr: String,
    #[serde(default)]
    pub password: String,
    /// Optional experiment website, linked from alarm mails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneConnection {
    pub url: String,
    pub fromnumber: String,
    /// (account sid, auth token) pair for basic auth.
    pub auth: (String, String),
    #[serde(default = "default_max_message_length")]
    pub maxmessagelength: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConnection {
    pub url: String,
    #[serde(default)]
    pub postparameters: BTreeMap<String, String>,
    #[serde(default = "default_max_message_length")]
    pub maxmessagelength: usize,
}

fn default_max_message_length() -> usize {
    160
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twilio: Option<PhoneConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websms: Option<SmsConnection>,
}

/// The alarm-system record: delivery channels, routing and silencing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfigDoc {
    #[serde(default)]
    pub connection_details: ConnectionDetails,
    /// Per-level delivery channels.
    pub protocols: Vec<Vec<Protocol>>,
    /// Per-level recipient groups.
    pub recipients: Vec<Vec<RecipientGroup>>,
    /// Per-level auto-silence after a successful delivery, seconds.
    pub silence_duration: Vec<f64>,
    /// Silence applied when no channel could deliver, seconds.
    pub silence_duration_cant_send: f64,
    /// Messages required at total level N before escalating.
    pub escalation_config: Vec<u64>,
    /// Slack added to a sensor's readout interval before it counts as stale.
    #[serde(default = "default_max_reading_delay")]
    pub max_reading_delay: f64,
}

fn default_max_reading_delay() -> f64 {
    30.0
}

// ============================================================================
// Contacts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactDoc {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub sms: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub on_shift: bool,
    #[serde(default)]
    pub expert: bool,
}

impl ContactDoc {
    /// The address to use for one delivery protocol, if the contact has one.
    pub fn address_for(&self, protocol: Protocol) -> Option<&str> {
        let addr = match protocol {
            Protocol::Sms => &self.sms,
            Protocol::Email => &self.email,
            Protocol::Phone => &self.phone,
        };
        if addr.is_empty() {
            None
        } else {
            Some(addr)
        }
    }
}

// ============================================================================
// Metrics store connection
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDoc {
    pub url: String,
    #[serde(default = "default_influx_version")]
    pub version: u8,
    #[serde(default = "default_precision")]
    pub precision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// The mapped database name for InfluxQL queries against v2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

fn default_influx_version() -> u8 {
    2
}

fn default_precision() -> String {
    "ms".to_string()
}

// ============================================================================
// Logs
// ============================================================================

/// A log record forwarded to the store's `logs` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDoc {
    pub msg: String,
    pub level: String,
    pub name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub date: DateTime<Utc>,
}
