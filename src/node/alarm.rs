//! Alarm nodes: predicate evaluation, escalation and auto-silencing.
//!
//! An alarm instance begins when a violated predicate first delivers a
//! message (allocating a stable 16-hex hash), escalates after a configured
//! number of repeats, and resets once the node observes a clean window.
//! After each successful delivery the owning pipeline silences itself at
//! the alarm's base level, so strictly higher-severity alarms can still
//! fire through.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::Document;
use crate::sample::{Sample, Value};
use crate::util::{
    format_sig_figs, level_index, make_hash, sensible_sig_figs, unix_now, ALARM_HASH_LEN,
};

use super::source::MetricsPull;
use super::{
    AlarmMessage, Behavior, Input, NodeCore, NodeError, Output, SensorBinding, SetupCtx,
};

/// Escalation and delivery state shared by all alarm kinds.
pub struct AlarmState {
    sensor: String,
    description: String,
    device: String,
    escalation_config: Vec<u64>,
    auto_silence_duration: Vec<f64>,
    silence_duration_cant_send: f64,
    max_reading_delay: f64,
    escalation_level: i64,
    messages_this_level: u64,
    hash: Option<String>,
}

impl AlarmState {
    fn from_ctx(core: &NodeCore, ctx: &SetupCtx) -> Result<Self, NodeError> {
        let sensor = core.input()?.to_string();
        let (description, device) = match &ctx.sensor {
            Some(doc) => (doc.description.clone(), doc.device.clone()),
            None => (
                ctx.opt_str("description").unwrap_or_default(),
                ctx.opt_str("device").unwrap_or_default(),
            ),
        };
        Ok(Self {
            sensor,
            description,
            device,
            escalation_config: ctx.alarm.escalation_config.clone(),
            auto_silence_duration: ctx.alarm.silence_duration.clone(),
            silence_duration_cant_send: ctx.alarm.silence_duration_cant_send,
            max_reading_delay: ctx.alarm.max_reading_delay,
            escalation_level: 0,
            messages_this_level: 0,
            hash: None,
        })
    }

    fn base_level(&self, core: &NodeCore) -> i64 {
        core.config_i64("alarm_level").unwrap_or(1)
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn messages_this_level(&self) -> u64 {
        self.messages_this_level
    }

    pub fn escalation_level(&self) -> i64 {
        self.escalation_level
    }

    /// Promote the effective severity once enough messages went out at the
    /// current total level.
    fn escalate(&mut self, core: &NodeCore) {
        if self.hash.is_none() {
            error!("How are you escalating if there is no active alarm?");
            return;
        }
        if self.escalation_config.is_empty() {
            return;
        }
        let base = self.base_level(core);
        let total = base + self.escalation_level;
        let needed = self.escalation_config[level_index(total, self.escalation_config.len())];
        if self.messages_this_level > needed {
            warn!(
                "{} at level {}/{} for {} messages, time to escalate (hash {})",
                core.name,
                base,
                self.escalation_level,
                self.messages_this_level,
                self.hash.as_deref().unwrap_or("?")
            );
            let max_total = self.escalation_config.len() as i64;
            self.escalation_level = (self.escalation_level + 1).min((max_total - base).max(0));
            self.messages_this_level = 0;
        } else {
            warn!(
                "{} at level {}/{} for {} messages, need {} to escalate",
                core.name, base, self.escalation_level, self.messages_this_level, needed
            );
        }
    }

    /// Clear the cached alarm state after a clean window.
    pub async fn reset(&mut self, core: &NodeCore) -> Result<(), NodeError> {
        core.services
            .store
            .set_sensor_field(&self.sensor, "alarm_is_triggered", false.into())
            .await?;
        if let Some(hash) = self.hash.take() {
            info!("{} resetting alarm {}", core.name, hash);
            self.messages_this_level = 0;
        }
        self.escalation_level = 0;
        Ok(())
    }

    /// Handle one predicate violation: mark the sensor, honor silencing,
    /// allocate the instance hash, escalate, deliver, self-silence.
    pub async fn trigger(
        &mut self,
        core: &NodeCore,
        message: String,
        timestamp: f64,
    ) -> Result<(), NodeError> {
        let services = &core.services;
        services
            .store
            .set_sensor_field(&self.sensor, "alarm_is_triggered", true.into())
            .await?;
        let base = self.base_level(core);
        let silenced_at = services.silenced_at_level();
        // a silence taken at a lower level does not gag higher-severity
        // alarms; a universal silence (-1) gags everything
        if !core.is_silent || (-1 < silenced_at && silenced_at < base) {
            warn!("{}", message);
            if self.hash.is_none() {
                let hash = make_hash(
                    [format!("{}", timestamp), services.pipeline_name.clone()],
                    ALARM_HASH_LEN,
                );
                warn!(
                    "{} beginning alarm with hash {}",
                    services.pipeline_name, hash
                );
                self.hash = Some(hash);
            }
            self.escalate(core);
            let level = base + self.escalation_level;
            let alarm = AlarmMessage {
                level,
                message,
                pipeline: services.pipeline_name.clone(),
                hash: self.hash.clone(),
                routing: None,
            };
            match services.alarms.log_alarm(alarm).await {
                Ok(()) => {
                    let duration = self
                        .auto_silence_duration
                        .get(level_index(level, self.auto_silence_duration.len()))
                        .copied()
                        .unwrap_or(self.silence_duration_cant_send);
                    services.silence_for(duration, base).await?;
                    self.messages_this_level += 1;
                }
                Err(e) => {
                    error!("Exception sending alarm: {}", e);
                    services
                        .silence_for(self.silence_duration_cant_send, base)
                        .await?;
                }
            }
        } else {
            debug!("{}", message);
        }
        Ok(())
    }

    async fn clear_triggered_flag(&self, core: &NodeCore) {
        if let Err(e) = core
            .services
            .store
            .set_sensor_field(&self.sensor, "alarm_is_triggered", false.into())
            .await
        {
            error!("Could not clear alarm flag on {}: {}", self.sensor, e);
        }
    }
}

fn state_mut<'a>(
    state: &'a mut Option<AlarmState>,
    core: &NodeCore,
) -> Result<&'a mut AlarmState, NodeError> {
    state
        .as_mut()
        .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))
}

/// Copy the buffer length out of `alarm_recurrence` and keep the rest of
/// the document as the runtime config.
fn load_recurrence_config(core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
    let recurrence = doc
        .get("alarm_recurrence")
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .ok_or_else(|| {
            NodeError::MissingParam(core.name.clone(), "alarm_recurrence".to_string())
        })?;
    core.buffer.set_limit(recurrence.max(1) as usize);
    core.config = doc.clone();
    Ok(())
}

// ============================================================================
// Threshold alarm
// ============================================================================

/// Checks values against the `[low, high]` bracket from the sensor
/// document. The endpoints are acceptable; only values outside alarm.
#[derive(Default)]
pub struct SimpleAlarm {
    state: Option<AlarmState>,
}

#[async_trait]
impl Behavior for SimpleAlarm {
    fn kind(&self) -> &'static str {
        "SimpleAlarmNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        true
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval", "alarm_thresholds", "alarm_recurrence", "alarm_level"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        Ok(())
    }

    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        load_recurrence_config(core, doc)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        let values = core.input_series(input.samples())?;
        let thresholds: [f64; 2] = core
            .config
            .get("alarm_thresholds")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| {
                NodeError::MissingParam(core.name.clone(), "alarm_thresholds".to_string())
            })?;
        let [low, high] = thresholds;
        let ok: Vec<bool> = values.iter().map(|v| (low..=high).contains(v)).collect();
        if ok.iter().all(|b| *b) {
            state.reset(core).await?;
        } else if ok.iter().any(|b| *b) {
            // mixed window: wait it out
        } else {
            let last = values[values.len() - 1];
            let too_high = last >= high;
            let mut message = format!("Alarm for {}. ", state.description);
            let bound = if too_high { high } else { low };
            match (
                sensible_sig_figs(last, low, high),
                sensible_sig_figs(bound, low, high),
            ) {
                (Some(value), Some(threshold)) => {
                    message.push_str(&format!(
                        "{} is {} the threshold {}.",
                        value,
                        if too_high { "above" } else { "below" },
                        threshold
                    ));
                }
                // corner cases like low == high
                _ => {
                    message.push_str(&format!(
                        "{} is outside allowed range of {} to {}.",
                        format_sig_figs(last, 3),
                        format_sig_figs(low, 3),
                        format_sig_figs(high, 3)
                    ));
                }
            }
            let timestamp = input.newest().time;
            state.trigger(core, message, timestamp).await?;
        }
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

// ============================================================================
// Integer status alarm
// ============================================================================

/// Integer status codes are a different animal from physical quantities;
/// the `alarm_values` map pairs each bad code with its message.
#[derive(Default)]
pub struct IntegerAlarm {
    state: Option<AlarmState>,
}

#[async_trait]
impl Behavior for IntegerAlarm {
    fn kind(&self) -> &'static str {
        "IntegerAlarmNode"
    }

    fn uses_buffer(&self) -> bool {
        true
    }

    fn strict(&self) -> bool {
        true
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval", "alarm_values", "alarm_recurrence", "alarm_level"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        Ok(())
    }

    fn load_config(&mut self, core: &mut NodeCore, doc: &Document) -> Result<(), NodeError> {
        load_recurrence_config(core, doc)
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        let values: Vec<i64> = core
            .input_series(input.samples())?
            .into_iter()
            .map(|v| v as i64)
            .collect();
        let table = core
            .config
            .get("alarm_values")
            .and_then(|v| v.as_object())
            .cloned()
            .ok_or_else(|| {
                NodeError::MissingParam(core.name.clone(), "alarm_values".to_string())
            })?;
        let bad: Vec<i64> = table.keys().filter_map(|k| k.parse().ok()).collect();
        let ok: Vec<bool> = values.iter().map(|v| !bad.contains(v)).collect();
        if ok.iter().all(|b| *b) {
            state.reset(core).await?;
        } else if ok.iter().any(|b| *b) {
            // mixed window
        } else if let Some(code) = values.iter().find(|v| bad.contains(v)) {
            let text = table
                .get(&code.to_string())
                .and_then(|v| v.as_str())
                .unwrap_or("unknown status");
            let message = format!("Alarm for {}: {}", state.description, text);
            state.trigger(core, message, input.newest().time).await?;
        }
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

// ============================================================================
// Bitmask alarm
// ============================================================================

fn parse_hex(text: &str) -> Option<i64> {
    let trimmed = text.trim_start_matches("0x").trim_start_matches("0X");
    i64::from_str_radix(trimmed, 16).ok()
}

/// Interprets the integer as a bitmask: each `(mask, target, message)` row
/// fires when `value & mask == target`. Mask and target are hex strings.
#[derive(Default)]
pub struct BitmaskIntegerAlarm {
    state: Option<AlarmState>,
}

#[async_trait]
impl Behavior for BitmaskIntegerAlarm {
    fn kind(&self) -> &'static str {
        "BitmaskIntegerAlarmNode"
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval", "alarm_level"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        let value = core.field_f64(input.newest(), core.input()?)? as i64;
        let rows: Vec<(String, String, String)> = core
            .config
            .get("alarm_thresholds")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| {
                NodeError::MissingParam(core.name.clone(), "alarm_thresholds".to_string())
            })?;
        let mut matched = Vec::new();
        for (mask, target, text) in &rows {
            let (Some(mask), Some(target)) = (parse_hex(mask), parse_hex(target)) else {
                return Err(NodeError::BadParam(
                    core.name.clone(),
                    "alarm_thresholds".to_string(),
                    format!("'{}'/'{}' is not hex", mask, target),
                ));
            };
            if value & mask == target {
                matched.push(text.clone());
            }
        }
        if matched.is_empty() {
            state.reset(core).await?;
        } else {
            let message = format!("Alarm for {}: {}", state.description, matched.join(","));
            state.trigger(core, message, input.newest().time).await?;
        }
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

// ============================================================================
// Time-at-value alarm
// ============================================================================

/// Accumulates wall time the reading sits at `alarm_value` and fires once
/// it exceeds `max_duration`. Good for "has this valve been open too long".
#[derive(Default)]
pub struct TimeSinceAlarm {
    state: Option<AlarmState>,
    time_at_value: f64,
    last_checked: Option<f64>,
}

#[async_trait]
impl Behavior for TimeSinceAlarm {
    fn kind(&self) -> &'static str {
        "TimeSinceAlarmNode"
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        Ok(())
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        let value = core.field_f64(input.newest(), core.input()?)? as i64;
        let alarm_value = core.require_i64("alarm_value")?;
        let max_duration = core.require_f64("max_duration")?;
        let now = unix_now();
        if value == alarm_value {
            self.time_at_value += now - self.last_checked.unwrap_or(now);
        } else {
            self.time_at_value = 0.0;
        }
        self.last_checked = Some(now);
        if self.time_at_value > max_duration {
            let message = format!(
                "Alarm for {}: value is at {} for more than {} seconds.",
                state.description, alarm_value, self.time_at_value as i64
            );
            state.trigger(core, message, now).await?;
        }
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

// ============================================================================
// Device-responding alarms
// ============================================================================

async fn check_device_responding(
    state: &mut AlarmState,
    core: &NodeCore,
    sample: &Sample,
) -> Result<(), NodeError> {
    let now = unix_now();
    let dt = now - sample.time;
    let readout_interval = core.require_f64("readout_interval")?;
    if dt > readout_interval + state.max_reading_delay {
        let message = format!(
            "Is {} responding correctly? No new value for {} has been seen in {} seconds",
            state.device, state.description, dt as i64
        );
        state.trigger(core, message, now).await
    } else {
        debug!(
            "{}: last value for {} is {} seconds old",
            core.name, state.sensor, dt as i64
        );
        state.reset(core).await
    }
}

/// Watches the metrics store for stale readings of one sensor.
#[derive(Default)]
pub struct DeviceRespondingInflux {
    state: Option<AlarmState>,
    pull: Option<MetricsPull>,
}

#[async_trait]
impl Behavior for DeviceRespondingInflux {
    fn kind(&self) -> &'static str {
        "DeviceRespondingInfluxNode"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval", "alarm_level"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        // old values are the whole point here
        self.pull = Some(MetricsPull::from_ctx(core, ctx, true)?);
        Ok(())
    }

    async fn acquire(&mut self, core: &mut NodeCore) -> Result<Option<Input>, NodeError> {
        let pull = self
            .pull
            .as_mut()
            .ok_or_else(|| NodeError::Other(format!("{} was never set up", core.name)))?;
        Ok(Some(Input::Newest(pull.pull(core).await?)))
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        check_device_responding(state, core, input.newest()).await?;
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

/// Watches the data bus for stale readings of one sensor.
#[derive(Default)]
pub struct DeviceRespondingSync {
    state: Option<AlarmState>,
}

#[async_trait]
impl Behavior for DeviceRespondingSync {
    fn kind(&self) -> &'static str {
        "DeviceRespondingSyncNode"
    }

    fn is_source(&self) -> bool {
        true
    }

    fn is_sync_source(&self) -> bool {
        true
    }

    fn sensor_binding(&self) -> SensorBinding {
        SensorBinding::Input
    }

    fn sensor_config_needed(&self) -> &'static [&'static str] {
        &["readout_interval", "alarm_level"]
    }

    async fn setup(&mut self, core: &mut NodeCore, ctx: &SetupCtx) -> Result<(), NodeError> {
        self.state = Some(AlarmState::from_ctx(core, ctx)?);
        Ok(())
    }

    fn on_receive(&mut self, core: &NodeCore, mut package: Sample) -> Sample {
        if let (Ok(input), Ok(output)) = (core.input(), core.output()) {
            let (input, output) = (input.to_string(), output.to_string());
            package.rename(&input, &output);
        }
        package
    }

    async fn process(&mut self, core: &mut NodeCore, input: &Input) -> Result<Output, NodeError> {
        let state = state_mut(&mut self.state, core)?;
        check_device_responding(state, core, input.newest()).await?;
        Ok(Output::Nothing)
    }

    async fn shutdown(&mut self, core: &mut NodeCore) {
        if let Some(state) = &self.state {
            state.clear_triggered_flag(core).await;
        }
    }
}

// ============================================================================
// Remote heartbeat
// ============================================================================

/// Reads the heartbeat file a paired experiment's hypervisor writes over
/// ssh. When it goes stale, pages the numbers listed in the file directly,
/// bypassing this experiment's contact routing.
#[derive(Default)]
pub struct CheckRemoteHeartbeat;

#[async_trait]
impl Behavior for CheckRemoteHeartbeat {
    fn kind(&self) -> &'static str {
        "CheckRemoteHeartbeatNode"
    }

    async fn process(&mut self, core: &mut NodeCore, _input: &Input) -> Result<Output, NodeError> {
        let directory = core.config_str("directory").unwrap_or("/scratch").to_string();
        let experiment = core
            .config_str("experiment_name")
            .unwrap_or(&core.services.experiment)
            .to_string();
        let path = format!("{}/remote_hb_{}", directory, experiment);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NodeError::Other(format!("can't read {}: {}", path, e)))?;
        let (stamp, numbers) = content
            .split_once('\n')
            .ok_or_else(|| NodeError::Other(format!("malformed heartbeat file {}", path)))?;
        let stamp: i64 = stamp
            .trim()
            .parse()
            .map_err(|_| NodeError::Other(format!("bad timestamp in {}", path)))?;
        let numbers: Vec<String> = numbers
            .trim()
            .split(',')
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        let dt = unix_now() - stamp as f64;
        let max_delay_sms = core.config_f64("max_delay_sms").unwrap_or(3.0 * 60.0);
        let max_delay_phone = core.config_f64("max_delay_phone").unwrap_or(10.0 * 60.0);
        if dt <= max_delay_sms {
            debug!(
                "Last remote heartbeat from {} was {} seconds ago",
                experiment, dt as i64
            );
            return Ok(Output::Nothing);
        }
        let message = format!(
            "The hypervisor of {} hasn't had a heartbeat for {} minutes.",
            experiment,
            (dt / 60.0).round() as i64
        );
        let mut routing = crate::store::ContactAddresses::new();
        routing.insert(crate::config::Protocol::Sms, numbers.clone());
        if dt > max_delay_phone {
            routing.insert(crate::config::Protocol::Phone, numbers);
        }
        let silence = core.config_f64("silence_duration").unwrap_or(300.0);
        if core.is_silent {
            debug!("{}", message);
            return Ok(Output::Nothing);
        }
        warn!("{}", message);
        let services = &core.services;
        let result = services
            .alarms
            .log_alarm(AlarmMessage {
                level: 1,
                message,
                pipeline: services.pipeline_name.clone(),
                hash: None,
                routing: Some(routing),
            })
            .await;
        if let Err(e) = result {
            error!("Exception sending alarm: {}", e);
        }
        // silence universally either way; there is nobody else to page
        services.silence_for(silence, -1).await?;
        Ok(Output::Nothing)
    }
}

// ============================================================================
// Triggered-alarm aggregation
// ============================================================================

/// Emits 1 when any watched sensor currently has its alarm flag set.
#[derive(Default)]
pub struct TriggeredAlarms;

#[async_trait]
impl Behavior for TriggeredAlarms {
    fn kind(&self) -> &'static str {
        "TriggeredAlarmsNode"
    }

    async fn process(&mut self, core: &mut NodeCore, _input: &Input) -> Result<Output, NodeError> {
        let watched: Vec<String> = match core.config.get("sensors_to_check") {
            None => core.services.store.sensor_names().await?,
            Some(serde_json::Value::String(s)) if s == "any" => {
                core.services.store.sensor_names().await?
            }
            Some(serde_json::Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(other) => {
                return Err(NodeError::BadParam(
                    core.name.clone(),
                    "sensors_to_check".to_string(),
                    format!("must be \"any\" or a list, not {}", other),
                ))
            }
        };
        for name in watched {
            if let Ok(sensor) = core.services.store.get_sensor(&name).await {
                if sensor.alarm_is_triggered {
                    debug!("{} in alarm state", name);
                    return Ok(Output::Scalar(Value::Int(1)));
                }
            }
        }
        Ok(Output::Scalar(Value::Int(0)))
    }
}
