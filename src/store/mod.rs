//! The configuration-store seam.
//!
//! Every process talks to the experiment's document store through the
//! [`ConfigStore`] trait: typed getters and setters over the `sensors`,
//! `pipelines`, `devices`, `hosts`, `experiment_config`, `contacts` and
//! `logs` collections. Production deployments implement this against their
//! document store of choice; [`MemoryStore`] is the in-process
//! implementation used by the test-suite, `--status` snapshots and
//! single-host bring-up, optionally seeded from a YAML file.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::error;

use crate::config::{
    AlarmConfigDoc, ContactDoc, DeviceDoc, HostDoc, HypervisorDoc, InfluxDoc, LogDoc, PipelineDoc,
    PipelineStats, Protocol, RecipientGroup, SensorDoc, SensorStatus, SYNC_PREFIX,
};
use crate::util::level_index;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no document named '{name}' in collection '{collection}'")]
    NotFound { collection: String, name: String },

    #[error("experiment config document '{0}' is missing")]
    MissingConfig(&'static str),

    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("could not read seed file: {0}")]
    Seed(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

fn not_found(collection: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        collection: collection.to_string(),
        name: name.to_string(),
    }
}

/// A partial update of the hypervisor document; unset fields are untouched.
#[derive(Debug, Default, Clone)]
pub struct HypervisorUpdate {
    pub manage: Option<String>,
    pub unmanage: Option<String>,
    pub activate: Option<String>,
    pub deactivate: Option<String>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

impl HypervisorUpdate {
    pub fn manage(name: impl Into<String>) -> Self {
        Self {
            manage: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn unmanage(name: impl Into<String>) -> Self {
        Self {
            unmanage: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn activate(name: impl Into<String>) -> Self {
        Self {
            activate: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn deactivate(name: impl Into<String>) -> Self {
        Self {
            deactivate: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat: Some(now),
            ..Default::default()
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }
}

/// Per-protocol delivery addresses resolved for one alarm level.
pub type ContactAddresses = BTreeMap<Protocol, Vec<String>>;

/// Typed access to the experiment's configuration documents.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    // --- sensors ---
    async fn get_sensor(&self, name: &str) -> Result<SensorDoc, StoreError>;
    async fn sensor_names(&self) -> Result<Vec<String>, StoreError>;
    async fn upsert_sensor(&self, doc: SensorDoc) -> Result<(), StoreError>;
    /// Drop the synthetic `X_SYNC_*` sensors (hypervisor startup).
    async fn delete_sync_sensors(&self) -> Result<(), StoreError>;
    async fn set_sensor_field(
        &self,
        name: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    // --- pipelines ---
    async fn get_pipeline(&self, name: &str) -> Result<PipelineDoc, StoreError>;
    async fn set_pipeline_values(
        &self,
        name: &str,
        updates: &[(&str, serde_json::Value)],
    ) -> Result<(), StoreError>;
    /// Names of active or silent pipelines of one flavor (`^<flavor>_`).
    async fn pipeline_names(&self, flavor: &str) -> Result<Vec<String>, StoreError>;
    async fn get_pipeline_stats(&self, name: &str) -> Result<PipelineStats, StoreError>;

    // --- devices and hosts ---
    async fn get_device(&self, name: &str) -> Result<DeviceDoc, StoreError>;
    async fn device_names(&self) -> Result<Vec<String>, StoreError>;
    async fn get_device_heartbeat(&self, device: &str) -> Result<DateTime<Utc>, StoreError>;
    async fn update_device_heartbeat(&self, device: &str) -> Result<(), StoreError>;
    async fn hosts(&self) -> Result<Vec<HostDoc>, StoreError>;

    // --- experiment config ---
    async fn hypervisor_config(&self) -> Result<HypervisorDoc, StoreError>;
    async fn update_hypervisor(&self, update: HypervisorUpdate) -> Result<(), StoreError>;
    async fn alarm_config(&self) -> Result<AlarmConfigDoc, StoreError>;
    async fn influx_config(&self) -> Result<InfluxDoc, StoreError>;

    // --- contacts ---
    async fn contacts(&self) -> Result<Vec<ContactDoc>, StoreError>;
    async fn set_contact_on_shift(&self, name: &str, on_shift: bool) -> Result<(), StoreError>;

    // --- logs ---
    async fn insert_log(&self, doc: LogDoc) -> Result<(), StoreError>;

    // --- derived accessors ---

    /// Names of the contacts currently on shift, sorted.
    async fn shifters(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .contacts()
            .await?
            .into_iter()
            .filter(|c| c.on_shift)
            .map(|c| c.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delivery protocols for one alarm level (1-based). Levels beyond the
    /// configured table fall back to the highest defined entry.
    async fn message_protocols(&self, level: i64) -> Result<Vec<Protocol>, StoreError> {
        let protocols = self.alarm_config().await?.protocols;
        if protocols.is_empty() {
            return Err(StoreError::MissingConfig("alarm.protocols"));
        }
        if (level.max(1) - 1) as usize >= protocols.len() {
            error!(
                "No message protocols for alarm level {}, defaulting to highest level defined",
                level
            );
        }
        Ok(protocols[level_index(level, protocols.len())].clone())
    }

    /// Recipient names for one alarm level (1-based); out-of-range levels
    /// go to everyone.
    async fn message_recipients(&self, level: i64) -> Result<Vec<String>, StoreError> {
        let recipients = self.alarm_config().await?.recipients;
        let groups = if (level.max(1) - 1) as usize >= recipients.len() {
            vec![RecipientGroup::Everyone]
        } else {
            recipients[level_index(level, recipients.len())].clone()
        };
        let contacts = self.contacts().await?;
        let mut names = Vec::new();
        for contact in &contacts {
            let wanted = groups.iter().any(|g| match g {
                RecipientGroup::Shifters => contact.on_shift,
                RecipientGroup::Experts => contact.expert,
                RecipientGroup::Everyone => true,
            });
            if wanted && !names.contains(&contact.name) {
                names.push(contact.name.clone());
            }
        }
        Ok(names)
    }

    /// Addresses to contact at `level` (1-based), keyed by protocol.
    async fn get_contact_addresses(&self, level: i64) -> Result<ContactAddresses, StoreError> {
        let protocols = self.message_protocols(level).await?;
        let recipients = self.message_recipients(level).await?;
        let contacts = self.contacts().await?;
        let mut out: ContactAddresses = protocols.iter().map(|p| (*p, Vec::new())).collect();
        for contact in contacts.iter().filter(|c| recipients.contains(&c.name)) {
            for protocol in &protocols {
                match (contact.address_for(*protocol), out.get_mut(protocol)) {
                    (Some(addr), Some(addresses)) => addresses.push(addr.to_string()),
                    _ => error!("No {} contact details for {}", protocol, contact.name),
                }
            }
        }
        Ok(out)
    }

    /// A snapshot of the whole experiment for the `--status` command.
    async fn current_status(&self) -> Result<StatusSnapshot, StoreError> {
        let now = Utc::now();
        let mut hosts = BTreeMap::new();
        for host in self.hosts().await? {
            let mut devices = BTreeMap::new();
            for device_name in &host.default {
                let Ok(device) = self.get_device(device_name).await else {
                    continue;
                };
                let mut sensors = BTreeMap::new();
                let sensor_names = device.multi.clone().unwrap_or_else(|| device.sensors.clone());
                for sensor_name in &sensor_names {
                    if let Ok(sensor) = self.get_sensor(sensor_name).await {
                        sensors.insert(
                            sensor_name.clone(),
                            SensorSummary {
                                description: sensor.description,
                                status: sensor.status,
                            },
                        );
                    }
                }
                devices.insert(
                    device_name.clone(),
                    DeviceSummary {
                        last_heartbeat_secs: device
                            .heartbeat
                            .map(|hb| (now - hb).num_milliseconds() as f64 / 1000.0),
                        sensors,
                    },
                );
            }
            hosts.insert(
                host.name.clone(),
                HostSummary {
                    status: host.status.clone(),
                    last_heartbeat_secs: host
                        .heartbeat
                        .map(|hb| (now - hb).num_milliseconds() as f64 / 1000.0),
                    devices,
                },
            );
        }
        Ok(StatusSnapshot { hosts })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorSummary {
    pub description: String,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub last_heartbeat_secs: Option<f64>,
    pub sensors: BTreeMap<String, SensorSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub status: String,
    pub last_heartbeat_secs: Option<f64>,
    pub devices: BTreeMap<String, DeviceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub hosts: BTreeMap<String, HostSummary>,
}

// ============================================================================
// In-process store
// ============================================================================

/// All collections of one experiment, as held by [`MemoryStore`] and as laid
/// out in its YAML seed files.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Collections {
    #[serde(default)]
    pub sensors: Vec<SensorDoc>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDoc>,
    #[serde(default)]
    pub devices: Vec<DeviceDoc>,
    #[serde(default)]
    pub hosts: Vec<HostDoc>,
    #[serde(default)]
    pub contacts: Vec<ContactDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypervisor: Option<HypervisorDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm: Option<AlarmConfigDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influx: Option<InfluxDoc>,
    #[serde(default)]
    pub logs: Vec<LogDoc>,
}

/// An in-process [`ConfigStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collections(collections: Collections) -> Self {
        Self {
            inner: RwLock::new(collections),
        }
    }

    /// Load a YAML seed file holding all collections.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StoreError::Seed(format!("{}: {}", path.as_ref().display(), e)))?;
        let collections: Collections =
            serde_yaml::from_str(&text).map_err(|e| StoreError::Seed(e.to_string()))?;
        Ok(Self::from_collections(collections))
    }

    /// A copy of the current contents, mostly for tests.
    pub async fn snapshot(&self) -> Collections {
        self.inner.read().await.clone()
    }
}

/// Apply `(field, value)` pairs to a document via its JSON form.
fn apply_updates<T>(doc: &T, updates: &[(&str, serde_json::Value)]) -> Result<T, StoreError>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let mut value = serde_json::to_value(doc)?;
    if let serde_json::Value::Object(map) = &mut value {
        for (field, new) in updates {
            map.insert(field.to_string(), new.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_sensor(&self, name: &str) -> Result<SensorDoc, StoreError> {
        self.inner
            .read()
            .await
            .sensors
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| not_found("sensors", name))
    }

    async fn sensor_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sensors
            .iter()
            .map(|s| s.name.clone())
            .collect())
    }

    async fn upsert_sensor(&self, doc: SensorDoc) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sensors.iter_mut().find(|s| s.name == doc.name) {
            Some(existing) => *existing = doc,
            None => inner.sensors.push(doc),
        }
        Ok(())
    }

    async fn delete_sync_sensors(&self) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .sensors
            .retain(|s| !s.name.starts_with(SYNC_PREFIX));
        Ok(())
    }

    async fn set_sensor_field(
        &self,
        name: &str,
        field: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sensor = inner
            .sensors
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| not_found("sensors", name))?;
        *sensor = apply_updates(sensor, &[(field, value)])?;
        Ok(())
    }

    async fn get_pipeline(&self, name: &str) -> Result<PipelineDoc, StoreError> {
        self.inner
            .read()
            .await
            .pipelines
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| not_found("pipelines", name))
    }

    async fn set_pipeline_values(
        &self,
        name: &str,
        updates: &[(&str, serde_json::Value)],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let pipeline = inner
            .pipelines
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| not_found("pipelines", name))?;
        *pipeline = apply_updates(pipeline, updates)?;
        Ok(())
    }

    async fn pipeline_names(&self, flavor: &str) -> Result<Vec<String>, StoreError> {
        let pattern = Regex::new(&format!("^{}_", regex::escape(flavor)))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(self
            .inner
            .read()
            .await
            .pipelines
            .iter()
            .filter(|p| {
                matches!(
                    p.status,
                    crate::config::PipelineStatus::Active | crate::config::PipelineStatus::Silent
                ) && pattern.is_match(&p.name)
            })
            .map(|p| p.name.clone())
            .collect())
    }

    async fn get_pipeline_stats(&self, name: &str) -> Result<PipelineStats, StoreError> {
        let doc = self.get_pipeline(name).await?;
        Ok(PipelineStats {
            status: doc.status,
            cycles: doc.cycles,
            error: doc.error,
            rate: doc.rate,
        })
    }

    async fn get_device(&self, name: &str) -> Result<DeviceDoc, StoreError> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| not_found("devices", name))
    }

    async fn device_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .iter()
            .map(|d| d.name.clone())
            .collect())
    }

    async fn get_device_heartbeat(&self, device: &str) -> Result<DateTime<Utc>, StoreError> {
        self.get_device(device)
            .await?
            .heartbeat
            .ok_or_else(|| not_found("devices.heartbeat", device))
    }

    async fn update_device_heartbeat(&self, device: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .devices
            .iter_mut()
            .find(|d| d.name == device)
            .ok_or_else(|| not_found("devices", device))?;
        doc.heartbeat = Some(Utc::now());
        Ok(())
    }

    async fn hosts(&self) -> Result<Vec<HostDoc>, StoreError> {
        Ok(self.inner.read().await.hosts.clone())
    }

    async fn hypervisor_config(&self) -> Result<HypervisorDoc, StoreError> {
        self.inner
            .read()
            .await
            .hypervisor
            .clone()
            .ok_or(StoreError::MissingConfig("hypervisor"))
    }

    async fn update_hypervisor(&self, update: HypervisorUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .hypervisor
            .as_mut()
            .ok_or(StoreError::MissingConfig("hypervisor"))?;
        if let Some(name) = update.manage {
            if !doc.processes.managed.contains(&name) {
                doc.processes.managed.push(name);
            }
        }
        if let Some(name) = update.unmanage {
            doc.processes.managed.retain(|n| n != &name);
        }
        if let Some(name) = update.activate {
            if !doc.processes.active.contains(&name) {
                doc.processes.active.push(name);
            }
        }
        if let Some(name) = update.deactivate {
            doc.processes.active.retain(|n| n != &name);
        }
        if let Some(heartbeat) = update.heartbeat {
            doc.heartbeat = Some(heartbeat);
        }
        if let Some(status) = update.status {
            doc.status = status;
        }
        Ok(())
    }

    async fn alarm_config(&self) -> Result<AlarmConfigDoc, StoreError> {
        self.inner
            .read()
            .await
            .alarm
            .clone()
            .ok_or(StoreError::MissingConfig("alarm"))
    }

    async fn influx_config(&self) -> Result<InfluxDoc, StoreError> {
        self.inner
            .read()
            .await
            .influx
            .clone()
            .ok_or(StoreError::MissingConfig("influx"))
    }

    async fn contacts(&self) -> Result<Vec<ContactDoc>, StoreError> {
        Ok(self.inner.read().await.contacts.clone())
    }

    async fn set_contact_on_shift(&self, name: &str, on_shift: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let contact = inner
            .contacts
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| not_found("contacts", name))?;
        contact.on_shift = on_shift;
        Ok(())
    }

    async fn insert_log(&self, doc: LogDoc) -> Result<(), StoreError> {
        self.inner.write().await.logs.push(doc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineStatus;

    fn seeded() -> MemoryStore {
        let yaml = r#"
sensors:
  - name: pressure_inner
    description: Inner vessel pressure
    device: baratron
    topic: pressure
    readout_interval: 5
    alarm_thresholds: [0, 10]
    alarm_recurrence: 3
    alarm_level: 1
pipelines:
  - name: alarm_pressure
    status: active
    depends_on: [pressure_inner]
  - name: convert_pressure
    status: silent
  - name: control_valve
    status: inactive
devices:
  - name: baratron
    host: daq0
contacts:
  - name: ada
    email: ada@example.org
    sms: "+1555"
    on_shift: true
  - name: grace
    email: grace@example.org
    sms: "+1666"
    phone: "+1666"
    expert: true
alarm:
  protocols: [[sms], [sms, email]]
  recipients: [[shifters], [shifters, experts]]
  silence_duration: [60, 300]
  silence_duration_cant_send: 30
  escalation_config: [3, 2]
  max_reading_delay: 20
"#;
        let collections: Collections = serde_yaml::from_str(yaml).unwrap();
        MemoryStore::from_collections(collections)
    }

    #[tokio::test]
    async fn test_sensor_lookup_and_field_update() {
        let store = seeded();
        let doc = store.get_sensor("pressure_inner").await.unwrap();
        assert_eq!(doc.alarm_thresholds, Some([0.0, 10.0]));
        assert!(!doc.alarm_is_triggered);

        store
            .set_sensor_field("pressure_inner", "alarm_is_triggered", true.into())
            .await
            .unwrap();
        assert!(store
            .get_sensor("pressure_inner")
            .await
            .unwrap()
            .alarm_is_triggered);
    }

    #[tokio::test]
    async fn test_pipeline_names_by_flavor() {
        let store = seeded();
        assert_eq!(
            store.pipeline_names("alarm").await.unwrap(),
            vec!["alarm_pressure"]
        );
        assert_eq!(
            store.pipeline_names("convert").await.unwrap(),
            vec!["convert_pressure"]
        );
        // inactive pipelines are not started
        assert!(store.pipeline_names("control").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_pipeline_values() {
        let store = seeded();
        store
            .set_pipeline_values(
                "alarm_pressure",
                &[("cycles", 7u64.into()), ("status", "silent".into())],
            )
            .await
            .unwrap();
        let doc = store.get_pipeline("alarm_pressure").await.unwrap();
        assert_eq!(doc.cycles, 7);
        assert_eq!(doc.status, PipelineStatus::Silent);
    }

    #[tokio::test]
    async fn test_contact_addresses_by_level() {
        let store = seeded();
        // level 1: sms to shifters only
        let addrs = store.get_contact_addresses(1).await.unwrap();
        assert_eq!(addrs[&Protocol::Sms], vec!["+1555"]);
        assert!(!addrs.contains_key(&Protocol::Email));
        // level 2: sms+email to shifters and experts
        let addrs = store.get_contact_addresses(2).await.unwrap();
        assert_eq!(addrs[&Protocol::Sms], vec!["+1555", "+1666"]);
        assert_eq!(
            addrs[&Protocol::Email],
            vec!["ada@example.org", "grace@example.org"]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_level_falls_back() {
        let store = seeded();
        // beyond the table: highest protocols, everyone
        let protocols = store.message_protocols(5).await.unwrap();
        assert_eq!(protocols, vec![Protocol::Sms, Protocol::Email]);
        let recipients = store.message_recipients(5).await.unwrap();
        assert_eq!(recipients, vec!["ada", "grace"]);
        // level 2 is exactly the last configured entry, no fallback
        assert_eq!(
            store.message_recipients(2).await.unwrap(),
            vec!["ada", "grace"]
        );
    }

    #[tokio::test]
    async fn test_shifters_sorted() {
        let store = seeded();
        assert_eq!(store.shifters().await.unwrap(), vec!["ada"]);
        store.set_contact_on_shift("grace", true).await.unwrap();
        assert_eq!(store.shifters().await.unwrap(), vec!["ada", "grace"]);
    }

    #[tokio::test]
    async fn test_sync_sensor_lifecycle() {
        let store = seeded();
        store
            .upsert_sensor(SensorDoc::sync_signal(5))
            .await
            .unwrap();
        assert!(store.get_sensor("X_SYNC_5").await.is_ok());
        store.delete_sync_sensors().await.unwrap();
        assert!(store.get_sensor("X_SYNC_5").await.is_err());
        // real sensors survive
        assert!(store.get_sensor("pressure_inner").await.is_ok());
    }
}
