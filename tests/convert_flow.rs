//! A conversion pipeline running against a live data proxy: samples
//! published on the bus drive cycles, and stopping the pipeline marks it
//! inactive.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use labwatch::bus::data::run_data_proxy;
use labwatch::bus::{CommandSender, DataMessage, DataPublisher};
use labwatch::config::PipelineStatus;
use labwatch::metrics::MetricsSink;
use labwatch::node::{NoAlarmSink, Services};
use labwatch::pipeline::Pipeline;
use labwatch::sample::Value;
use labwatch::store::{Collections, ConfigStore, MemoryStore};

fn collections() -> Collections {
    serde_yaml::from_str(
        r#"
sensors:
  - name: raw_level
    topic: level
    readout_interval: 5
pipelines:
  - name: convert_level
    status: active
    depends_on: [raw_level]
    pipeline:
      - {name: source, type: SensorSourceNode, input_var: raw_level,
         new_value_required: true}
      - {name: calibrate, type: PolynomialNode, upstream: [source],
         input_var: raw_level, output_var: level}
    node_config:
      calibrate: {transform: [1, 2]}
hypervisor:
  host: 127.0.0.1
  path: /opt/labwatch
  period: 30
  comms:
    data: {send: 43230, recv: 43231}
    command: {send: 43232, recv: 43233}
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
async fn test_sync_pipeline_cycles_on_bus_arrivals() {
    let store = Arc::new(MemoryStore::from_collections(collections()));

    // bring up a data proxy on the configured ports
    let send_listener = TcpListener::bind("127.0.0.1:43230").await.unwrap();
    let recv_listener = TcpListener::bind("127.0.0.1:43231").await.unwrap();
    let (proxy_shutdown, proxy_rx) = watch::channel(false);
    tokio::spawn(run_data_proxy(send_listener, recv_listener, proxy_rx));

    let influx = store.influx_config().await.unwrap();
    let services = Arc::new(Services::new(
        "testing",
        "convert_level",
        store.clone() as Arc<dyn ConfigStore>,
        Arc::new(MetricsSink::from_config(&influx, "testing").unwrap()),
        Arc::new(NoAlarmSink),
        Arc::new(CommandSender::new("127.0.0.1", 43232)),
        Arc::new(DataPublisher::new("127.0.0.1", 43230)),
    ));
    let doc = store.get_pipeline("convert_level").await.unwrap();
    let pipeline = Pipeline::build(&doc, services).await.unwrap();
    assert!(pipeline.is_sync());

    let (cancel, cancel_rx) = watch::channel(None);
    let runner = tokio::spawn(pipeline.run(cancel_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // publish a few samples; each one completes the required set and
    // triggers a cycle
    let publisher = DataPublisher::new("127.0.0.1", 43230);
    for i in 0..3 {
        publisher
            .publish(&DataMessage {
                name: "raw_level".to_string(),
                time: 1000.0 + i as f64,
                value: Value::Float(2.0),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut cycles = 0;
    for _ in 0..20 {
        cycles = store.get_pipeline("convert_level").await.unwrap().cycles;
        if cycles >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cycles >= 3, "pipeline never cycled, got {}", cycles);
    let doc = store.get_pipeline("convert_level").await.unwrap();
    assert!(doc.heartbeat.is_some());

    // stopping without keep_status marks the pipeline inactive
    cancel.send(Some(false)).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;
    let doc = store.get_pipeline("convert_level").await.unwrap();
    assert_eq!(doc.status, PipelineStatus::Inactive);

    let _ = proxy_shutdown.send(true);
}
