//! The pipeline monitor: hosts every pipeline of one flavor.
//!
//! Pipelines come in three flavors: they raise alarms, convert raw values
//! into processed ones, or control something in the system. One monitor
//! process owns each flavor and starts, stops and restarts its pipelines
//! on command.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::bus::{CommandSender, DataPublisher};
use crate::metrics::MetricsSink;
use crate::node::{AlarmMessage, AlarmSink, Services};
use crate::pipeline::Pipeline;
use crate::store::ConfigStore;
use crate::util::{make_hash, unix_now, ALARM_HASH_LEN};

use super::{Monitor, MonitorApp};

pub const FLAVORS: [&str; 3] = ["alarm", "control", "convert"];

struct RunningPipeline {
    cancel: watch::Sender<Option<bool>>,
    handle: JoinHandle<()>,
}

/// Hosts all pipelines of one flavor inside one process.
pub struct PipelineMonitor {
    name: String,
    flavor: String,
    experiment: String,
    store: Arc<dyn ConfigStore>,
    metrics: Arc<MetricsSink>,
    alarms: Arc<dyn AlarmSink>,
    commands: Arc<CommandSender>,
    data: Arc<DataPublisher>,
    pipelines: Mutex<HashMap<String, RunningPipeline>>,
}

impl PipelineMonitor {
    /// Build a monitor for one flavor; `alarms` is the delivery seam (the
    /// real deliverer in the alarm monitor, a refusing one elsewhere).
    pub async fn new(
        flavor: &str,
        experiment: &str,
        store: Arc<dyn ConfigStore>,
        alarms: Arc<dyn AlarmSink>,
    ) -> anyhow::Result<Self> {
        if !FLAVORS.contains(&flavor) {
            anyhow::bail!(
                "unknown pipeline flavor '{}', allowed are alarm, control, convert",
                flavor
            );
        }
        let hypervisor = store.hypervisor_config().await?;
        let influx = store.influx_config().await?;
        let metrics = Arc::new(MetricsSink::from_config(&influx, experiment)?);
        let commands = Arc::new(CommandSender::new(
            &hypervisor.host,
            hypervisor.comms.command.send,
        ));
        let data = Arc::new(DataPublisher::new(
            &hypervisor.host,
            hypervisor.comms.data.send,
        ));
        Ok(Self {
            name: format!("pl_{}", flavor),
            flavor: flavor.to_string(),
            experiment: experiment.to_string(),
            store,
            metrics,
            alarms,
            commands,
            data,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start_pipeline(&self, name: &str) {
        if self.pipelines.lock().await.contains_key(name) {
            error!("I already manage a pipeline called {}", name);
            return;
        }
        let doc = match self.store.get_pipeline(name).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("No pipeline named {} found: {}", name, e);
                return;
            }
        };
        info!("Starting pipeline {}", name);
        if let Err(e) = self
            .store
            .set_pipeline_values(
                name,
                &[("status", "active".into()), ("silent_until", 0.into())],
            )
            .await
        {
            error!("Could not activate {}: {}", name, e);
            return;
        }
        let services = Arc::new(Services::new(
            self.experiment.clone(),
            name,
            self.store.clone(),
            self.metrics.clone(),
            self.alarms.clone(),
            self.commands.clone(),
            self.data.clone(),
        ));
        let pipeline = match Pipeline::build(&doc, services).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!("Could not build pipeline {}: {}", name, e);
                let _ = self
                    .store
                    .set_pipeline_values(name, &[("status", "inactive".into())])
                    .await;
                return;
            }
        };
        let (cancel, cancel_rx) = watch::channel(None);
        let handle = tokio::spawn(pipeline.run(cancel_rx));
        self.pipelines
            .lock()
            .await
            .insert(name.to_string(), RunningPipeline { cancel, handle });
    }

    pub async fn stop_pipeline(&self, name: &str, keep_status: bool) {
        info!("Stopping pipeline {}", name);
        let Some(running) = self.pipelines.lock().await.remove(name) else {
            error!("I don't control the \"{}\" pipeline", name);
            return;
        };
        let _ = running.cancel.send(Some(keep_status));
        if tokio::time::timeout(std::time::Duration::from_secs(5), running.handle)
            .await
            .is_err()
        {
            error!("Pipeline {} did not stop in time", name);
        }
    }

    async fn owns(&self, name: &str) -> bool {
        let owned = self.pipelines.lock().await.contains_key(name);
        if !owned {
            error!("I don't control the \"{}\" pipeline", name);
        }
        owned
    }

    pub async fn testalarm(&self, level: i64) {
        let message = format!("This is a level {} test alarm", level);
        let alarm = AlarmMessage {
            level,
            message,
            pipeline: self.name.clone(),
            hash: Some(make_hash(
                [format!("{}", unix_now()), self.name.clone()],
                ALARM_HASH_LEN,
            )),
            routing: None,
        };
        if let Err(e) = self.alarms.log_alarm(alarm).await {
            error!("Could not send level {} test alarm: {}", level, e);
        }
    }

    pub async fn handle_command(&self, command: &str) {
        let (verb, argument) = match command.split_once(' ') {
            Some((verb, argument)) => (verb, argument.trim()),
            None => (command, ""),
        };
        match verb {
            "pipelinectl_start" => self.start_pipeline(argument).await,
            "pipelinectl_stop" => {
                if self.owns(argument).await {
                    self.stop_pipeline(argument, false).await;
                }
            }
            "pipelinectl_restart" => {
                if self.owns(argument).await {
                    self.stop_pipeline(argument, false).await;
                    self.start_pipeline(argument).await;
                }
            }
            "pipelinectl_silent" => {
                if self.owns(argument).await {
                    info!("Silencing {}", argument);
                    if let Err(e) = self
                        .store
                        .set_pipeline_values(argument, &[("silent_until", (-1).into())])
                        .await
                    {
                        error!("Could not silence {}: {}", argument, e);
                    }
                }
            }
            "pipelinectl_active" => {
                if self.owns(argument).await {
                    info!("Activating {}", argument);
                    if let Err(e) = self
                        .store
                        .set_pipeline_values(argument, &[("silent_until", unix_now().into())])
                        .await
                    {
                        error!("Could not activate {}: {}", argument, e);
                    }
                }
            }
            "testalarm" => match argument.parse::<i64>() {
                Ok(level) => {
                    info!("Sending level {} test alarm", level);
                    self.testalarm(level).await;
                }
                Err(_) => error!("testalarm needs a numeric level, not '{}'", argument),
            },
            _ => error!("I don't understand command \"{}\"", command),
        }
    }

    pub async fn start_configured(&self) -> anyhow::Result<()> {
        for name in self.store.pipeline_names(&self.flavor).await? {
            self.start_pipeline(&name).await;
        }
        if self.flavor == "control" {
            // the hard-coded test routine; it runs one cycle and stops
            // itself through its own control node
            self.start_pipeline("test_pipeline").await;
        }
        Ok(())
    }

    pub async fn stop_all(&self, keep_status: bool) {
        let names: Vec<String> = self.pipelines.lock().await.keys().cloned().collect();
        for name in names {
            self.stop_pipeline(&name, keep_status).await;
        }
    }
}

#[async_trait]
impl MonitorApp for PipelineMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(self: Arc<Self>, _monitor: &Arc<Monitor>) -> anyhow::Result<()> {
        self.start_configured().await
    }

    async fn process_command(self: Arc<Self>, _monitor: &Arc<Monitor>, command: &str) {
        self.handle_command(command).await;
    }

    async fn shutdown(self: Arc<Self>, _monitor: &Arc<Monitor>) {
        info!("{} shutting down", self.name);
        self.stop_all(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineStatus;
    use crate::node::NoAlarmSink;
    use crate::store::{Collections, ConfigStore, MemoryStore};

    async fn monitor_with(collections: Collections) -> (PipelineMonitor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::from_collections(collections));
        let monitor = PipelineMonitor::new(
            "convert",
            "testing",
            store.clone(),
            Arc::new(NoAlarmSink),
        )
        .await
        .unwrap();
        (monitor, store)
    }

    fn seed() -> Collections {
        serde_yaml::from_str(
            r#"
sensors:
  - name: pressure_inner
    topic: pressure
    readout_interval: 5
pipelines:
  - name: convert_pressure
    status: active
    depends_on: [pressure_inner]
    pipeline:
      - {name: source, type: SensorSourceNode, input_var: pressure_inner}
    node_config: {}
hypervisor:
  host: 127.0.0.1
  path: /opt/labwatch
  comms:
    data: {send: 18914, recv: 18915}
    command: {send: 18916, recv: 18917}
alarm:
  protocols: [[sms]]
  recipients: [[shifters]]
  silence_duration: [60]
  silence_duration_cant_send: 30
  escalation_config: [3]
influx:
  url: http://localhost:8086
  org: t
  bucket: t
  db: t
  token: t
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_unknown_flavor() {
        let store = Arc::new(MemoryStore::from_collections(seed()));
        assert!(
            PipelineMonitor::new("sideways", "testing", store, Arc::new(NoAlarmSink))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_pipeline() {
        let (monitor, store) = monitor_with(seed()).await;
        monitor.start_pipeline("convert_pressure").await;
        assert!(monitor.pipelines.lock().await.contains_key("convert_pressure"));
        let doc = store.get_pipeline("convert_pressure").await.unwrap();
        assert_eq!(doc.status, PipelineStatus::Active);
        assert_eq!(doc.silent_until, 0.0);

        monitor.stop_pipeline("convert_pressure", false).await;
        assert!(monitor.pipelines.lock().await.is_empty());
        let doc = store.get_pipeline("convert_pressure").await.unwrap();
        assert_eq!(doc.status, PipelineStatus::Inactive);
    }

    #[tokio::test]
    async fn test_stop_with_keep_status_preserves_doc() {
        let (monitor, store) = monitor_with(seed()).await;
        monitor.start_pipeline("convert_pressure").await;
        monitor.stop_pipeline("convert_pressure", true).await;
        let doc = store.get_pipeline("convert_pressure").await.unwrap();
        assert_eq!(doc.status, PipelineStatus::Active);
    }

    #[tokio::test]
    async fn test_double_start_is_refused() {
        let (monitor, _store) = monitor_with(seed()).await;
        monitor.start_pipeline("convert_pressure").await;
        monitor.start_pipeline("convert_pressure").await;
        assert_eq!(monitor.pipelines.lock().await.len(), 1);
        monitor.stop_all(true).await;
    }

    #[tokio::test]
    async fn test_broken_pipeline_marked_inactive() {
        let mut collections = seed();
        collections.pipelines.push(
            serde_json::from_value(serde_json::json!({
                "name": "convert_broken",
                "status": "active",
                "pipeline": [{"name": "x", "type": "NopeNode"}],
                "node_config": {}
            }))
            .unwrap(),
        );
        let (monitor, store) = monitor_with(collections).await;
        monitor.start_pipeline("convert_broken").await;
        assert!(monitor.pipelines.lock().await.is_empty());
        let doc = store.get_pipeline("convert_broken").await.unwrap();
        assert_eq!(doc.status, PipelineStatus::Inactive);
    }

    #[tokio::test]
    async fn test_silence_command_sets_indefinite() {
        let (monitor, store) = monitor_with(seed()).await;
        monitor.start_pipeline("convert_pressure").await;
        monitor.handle_command("pipelinectl_silent convert_pressure").await;
        let doc = store.get_pipeline("convert_pressure").await.unwrap();
        assert_eq!(doc.silent_until, -1.0);
        monitor.handle_command("pipelinectl_active convert_pressure").await;
        let doc = store.get_pipeline("convert_pressure").await.unwrap();
        assert!(doc.silent_until > 0.0);
        monitor.stop_all(true).await;
    }
}
