//! The alarm lifecycle end to end: threshold violation, auto-silencing,
//! escalation after repeated deliveries, and reset on a clean window.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use labwatch::bus::{CommandSender, DataMessage, DataPublisher};
use labwatch::metrics::MetricsSink;
use labwatch::node::{AlarmMessage, AlarmSink, DeliveryError, Services};
use labwatch::pipeline::Pipeline;
use labwatch::sample::Value;
use labwatch::store::{Collections, ConfigStore, MemoryStore};
use labwatch::util::unix_now;

/// Captures deliveries instead of sending them anywhere; can be told to
/// refuse them like a dead gateway would.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<AlarmMessage>>,
    fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl AlarmSink for RecordingSink {
    async fn log_alarm(&self, alarm: AlarmMessage) -> Result<(), DeliveryError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(DeliveryError::Provider("gateway is down".to_string()));
        }
        self.delivered.lock().await.push(alarm);
        Ok(())
    }
}

fn collections() -> Collections {
    serde_yaml::from_str(
        r#"
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
    pipeline:
      - {name: source, type: SensorSourceNode, input_var: pressure_inner}
      - {name: watchdog, type: SimpleAlarmNode, upstream: [source],
         input_var: pressure_inner}
    node_config: {}
hypervisor:
  host: 127.0.0.1
  path: /opt/labwatch
  period: 30
  comms:
    data: {send: 43260, recv: 43261}
    command: {send: 43262, recv: 43263}
alarm:
  protocols: [[sms], [sms, email], [sms, email, phone]]
  recipients: [[shifters], [shifters], [shifters, experts]]
  silence_duration: [60, 300, 600]
  silence_duration_cant_send: 30
  escalation_config: [3, 2, 1]
  max_reading_delay: 20
contacts:
  - {name: ada, sms: "+1555", on_shift: true}
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

struct Rig {
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    pipeline: Pipeline,
    next_time: f64,
}

impl Rig {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::from_collections(collections()));
        let sink = Arc::new(RecordingSink::default());
        let influx = store.influx_config().await.unwrap();
        let metrics = Arc::new(MetricsSink::from_config(&influx, "testing").unwrap());
        let services = Arc::new(Services::new(
            "testing",
            "alarm_pressure",
            store.clone() as Arc<dyn ConfigStore>,
            metrics,
            sink.clone() as Arc<dyn AlarmSink>,
            Arc::new(CommandSender::new("127.0.0.1", 1)),
            Arc::new(DataPublisher::new("127.0.0.1", 1)),
        ));
        let doc = store.get_pipeline("alarm_pressure").await.unwrap();
        let pipeline = Pipeline::build(&doc, services).await.unwrap();
        Self {
            store,
            sink,
            pipeline,
            next_time: 1000.0,
        }
    }

    /// Feed one reading and run one cycle.
    async fn feed(&mut self, value: f64) {
        self.next_time += 1.0;
        self.pipeline.handle_data(&DataMessage {
            name: "pressure_inner".to_string(),
            time: self.next_time,
            value: Value::Float(value),
        });
        self.pipeline.process_cycle().await.unwrap();
    }

    /// Lift any auto-silence so the next violation can deliver.
    async fn unsilence(&self) {
        self.store
            .set_pipeline_values("alarm_pressure", &[("silent_until", 0.into())])
            .await
            .unwrap();
    }

    async fn delivered(&self) -> Vec<AlarmMessage> {
        self.sink.delivered.lock().await.clone()
    }

    async fn silent_until(&self) -> f64 {
        self.store
            .get_pipeline("alarm_pressure")
            .await
            .unwrap()
            .silent_until
    }

    async fn triggered(&self) -> bool {
        self.store
            .get_sensor("pressure_inner")
            .await
            .unwrap()
            .alarm_is_triggered
    }

    /// Run enough clean cycles to get past the startup suppression.
    async fn warm_up(&mut self) {
        while self.pipeline.cycles() <= self.pipeline.startup_cycles() {
            self.feed(5.0).await;
        }
        assert!(self.delivered().await.is_empty());
    }
}

#[tokio::test]
async fn test_threshold_alarm_delivers_once_and_silences() {
    let mut rig = Rig::new().await;
    rig.warm_up().await;

    // one in-range value then three violations fill the recurrence buffer
    rig.feed(5.0).await;
    rig.feed(12.0).await;
    rig.feed(12.0).await;
    rig.feed(12.0).await;

    let delivered = rig.delivered().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].level, 1);
    assert!(delivered[0].message.contains("above"));
    assert!(delivered[0].hash.is_some());
    assert!(rig.triggered().await);
    // auto-silenced for the level-1 duration
    let until = rig.silent_until().await;
    assert!(until > unix_now() + 50.0 && until < unix_now() + 70.0);

    // while silent, further violations are suppressed
    rig.feed(12.0).await;
    assert_eq!(rig.delivered().await.len(), 1);
}

#[tokio::test]
async fn test_escalation_after_repeated_deliveries() {
    let mut rig = Rig::new().await;
    rig.warm_up().await;
    for _ in 0..3 {
        rig.feed(12.0).await;
    }

    // force the silence away after each delivery and keep violating
    for _ in 0..5 {
        rig.unsilence().await;
        rig.feed(12.0).await;
    }
    let delivered = rig.delivered().await;
    assert!(delivered.len() >= 5);
    // the first deliveries go out at the base level
    assert!(delivered[..4].iter().all(|a| a.level == 1));
    // once messages_this_level exceeds the configured count, the next one
    // escalates
    assert_eq!(delivered[4].level, 2);
    // and the silence follows the escalated level
    let until = rig.silent_until().await;
    assert!(until > unix_now() + 250.0 && until < unix_now() + 350.0);
    // the instance hash is stable across every delivery
    let hashes: std::collections::HashSet<_> =
        delivered.iter().map(|a| a.hash.clone().unwrap()).collect();
    assert_eq!(hashes.len(), 1);
}

#[tokio::test]
async fn test_clean_window_resets_the_alarm() {
    let mut rig = Rig::new().await;
    rig.warm_up().await;
    for _ in 0..3 {
        rig.feed(12.0).await;
    }
    assert!(rig.triggered().await);
    let first_hash = rig.delivered().await[0].hash.clone();

    // a full clean buffer resets the alarm state
    rig.unsilence().await;
    for _ in 0..3 {
        rig.feed(5.0).await;
    }
    assert!(!rig.triggered().await);

    // a fresh violation starts a new instance with a new hash
    rig.unsilence().await;
    for _ in 0..3 {
        rig.feed(12.0).await;
    }
    let delivered = rig.delivered().await;
    assert_eq!(delivered.len(), 2);
    assert_ne!(delivered[1].hash, first_hash);
}

#[tokio::test]
async fn test_failed_delivery_applies_cant_send_silence() {
    let mut rig = Rig::new().await;
    rig.warm_up().await;
    rig.sink
        .fail
        .store(true, std::sync::atomic::Ordering::Relaxed);
    for _ in 0..3 {
        rig.feed(12.0).await;
    }
    // nothing went out, and the short can't-send silence applies instead
    // of the per-level one
    assert!(rig.delivered().await.is_empty());
    assert!(rig.triggered().await);
    let until = rig.silent_until().await;
    assert!(until > unix_now() + 20.0 && until < unix_now() + 40.0);
}

#[tokio::test]
async fn test_boundary_values_do_not_fire() {
    let mut rig = Rig::new().await;
    rig.warm_up().await;
    // the endpoints of the bracket are acceptable values
    for _ in 0..3 {
        rig.feed(10.0).await;
    }
    for _ in 0..3 {
        rig.feed(0.0).await;
    }
    assert!(rig.delivered().await.is_empty());
    assert!(!rig.triggered().await);
}
