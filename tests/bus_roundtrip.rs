//! End-to-end checks of the data-bus proxy: publishers on the `send` port
//! reach subscribers on the `recv` port, filtered by topic prefix.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use labwatch::bus::data::run_data_proxy;
use labwatch::bus::{DataMessage, DataPublisher, DataSubscriber};
use labwatch::sample::Value;

async fn start_proxy() -> (u16, u16, watch::Sender<bool>) {
    let send_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let recv_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let send_port = send_listener.local_addr().unwrap().port();
    let recv_port = recv_listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_data_proxy(send_listener, recv_listener, shutdown_rx));
    (send_port, recv_port, shutdown_tx)
}

#[tokio::test]
async fn test_published_samples_reach_matching_subscribers() {
    let (send_port, recv_port, shutdown) = start_proxy().await;

    let mut subscriber = DataSubscriber::connect(
        "127.0.0.1",
        recv_port,
        &["pressure_inner".to_string()],
    )
    .await
    .unwrap();
    // let the broker register the subscription before publishing
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publisher = DataPublisher::new("127.0.0.1", send_port);
    publisher
        .publish(&DataMessage {
            name: "level_meter".to_string(),
            time: 999.0,
            value: Value::Float(1.0),
        })
        .await
        .unwrap();
    publisher
        .publish(&DataMessage {
            name: "pressure_inner".to_string(),
            time: 1000.0,
            value: Value::Float(3.5),
        })
        .await
        .unwrap();

    // only the matching topic arrives
    let msg = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
        .await
        .expect("subscriber timed out")
        .unwrap();
    assert_eq!(msg.name, "pressure_inner");
    assert_eq!(msg.time, 1000.0);
    assert_eq!(msg.value, Value::Float(3.5));

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_multiple_subscribers_fan_out() {
    let (send_port, recv_port, shutdown) = start_proxy().await;

    let topics = vec!["valve_state".to_string()];
    let mut first = DataSubscriber::connect("127.0.0.1", recv_port, &topics)
        .await
        .unwrap();
    let mut second = DataSubscriber::connect("127.0.0.1", recv_port, &topics)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publisher = DataPublisher::new("127.0.0.1", send_port);
    publisher
        .publish(&DataMessage {
            name: "valve_state".to_string(),
            time: 5.0,
            value: Value::Int(1),
        })
        .await
        .unwrap();

    for subscriber in [&mut first, &mut second] {
        let msg = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("subscriber timed out")
            .unwrap();
        assert_eq!(msg.name, "valve_state");
        assert_eq!(msg.value, Value::Int(1));
    }

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn test_sync_prefix_subscription_catches_all_periods() {
    let (send_port, recv_port, shutdown) = start_proxy().await;

    let mut subscriber =
        DataSubscriber::connect("127.0.0.1", recv_port, &["X_SYNC_".to_string()])
            .await
            .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let publisher = DataPublisher::new("127.0.0.1", send_port);
    for line in ["X_SYNC_5 100.000 0", "X_SYNC_10 100.000 0"] {
        publisher.send_line(line.to_string()).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("subscriber timed out")
            .unwrap();
        seen.push(msg.name);
    }
    seen.sort();
    assert_eq!(seen, vec!["X_SYNC_10", "X_SYNC_5"]);

    let _ = shutdown.send(true);
}
