//! The hypervisor's brokers end to end: a worker connects to the command
//! bus, receives addressed commands with hashed acknowledgements, and sync
//! signals tick on the data bus.

use std::sync::Arc;
use std::time::Duration;

use labwatch::bus::{CommandEnvelope, CommandListener, CommandSender, DataSubscriber, Delivery};
use labwatch::hypervisor::Hypervisor;
use labwatch::monitor::run_monitor;
use labwatch::store::{Collections, ConfigStore, MemoryStore};

fn collections() -> Collections {
    serde_yaml::from_str(
        r#"
pipelines: []
devices: []
hypervisor:
  host: 127.0.0.1
  path: /nonexistent
  period: 600
  comms:
    data: {send: 43210, recv: 43211}
    command: {send: 43212, recv: 43213}
  sync_periods: [1]
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

async fn connect_listener(port: u16, name: &str) -> CommandListener {
    for _ in 0..50 {
        if let Ok(listener) = CommandListener::connect("127.0.0.1", port, name).await {
            return listener;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("broker never came up on port {}", port);
}

#[tokio::test]
async fn test_command_envelope_delivery_and_sync_signals() {
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::from_collections(collections()));
    let hypervisor = Hypervisor::new("testing", store.clone(), false, "/tmp/labwatch-test-logs");
    let runner = tokio::spawn(run_monitor(hypervisor, "testing", store.clone()));

    // a worker appears on the command bus
    let mut listener = connect_listener(43213, "workerbee").await;
    let sender = CommandSender::new("127.0.0.1", 43212);

    // another party queues a command addressed to the worker
    sender
        .envelope(&CommandEnvelope {
            to: "workerbee".to_string(),
            time: 0.0,
            from: "test".to_string(),
            command: "set valve 1".to_string(),
        })
        .await
        .unwrap();

    let delivery = loop {
        let line = tokio::time::timeout(Duration::from_secs(10), listener.recv())
            .await
            .expect("no delivery arrived")
            .unwrap();
        if line == "ping" || line.starts_with("ping ") {
            continue;
        }
        break Delivery::parse(&line).unwrap();
    };
    assert_eq!(delivery.command, "set valve 1");
    assert_eq!(delivery.hash.len(), 6);
    sender.ack("workerbee", &delivery.hash).await.unwrap();

    // the sync sensor appears once setup finishes, and its signal ticks on
    // the data bus
    let mut sensor_created = false;
    for _ in 0..50 {
        if store.get_sensor("X_SYNC_1").await.is_ok() {
            sensor_created = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(sensor_created, "X_SYNC_1 sensor never appeared");
    let mut data = DataSubscriber::connect("127.0.0.1", 43211, &["X_SYNC_1".to_string()])
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(5), data.recv())
        .await
        .expect("no sync signal arrived")
        .unwrap();
    assert_eq!(msg.name, "X_SYNC_1");

    runner.abort();
}
