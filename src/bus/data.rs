//! Data-bus clients and the hypervisor-side proxy.
//!
//! Data messages are `<sensor_name> <time_seconds> <value>` lines. Device
//! processes and conversion sinks publish to the broker's `send` port; sync
//! pipelines subscribe on the `recv` port with sensor-name prefixes.

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::info;

use crate::sample::{parse_scalar, Value};

use super::{fanout_channel, framed, run_fanin, run_fanout, BusError};

/// One published reading.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub name: String,
    pub time: f64,
    pub value: Value,
}

impl DataMessage {
    pub fn parse(line: &str) -> Result<Self, BusError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(name), Some(time), Some(value)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BusError::BadMessage(line.to_string()));
        };
        let time = time
            .parse::<f64>()
            .map_err(|_| BusError::BadMessage(line.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            time,
            value: parse_scalar(value),
        })
    }
}

impl fmt::Display for DataMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.3} {}", self.name, self.time, self.value)
    }
}

/// A reconnecting line publisher, shared by sinks and the sync-signal task.
pub struct DataPublisher {
    addr: String,
    conn: Mutex<Option<Framed<TcpStream, LinesCodec>>>,
}

impl DataPublisher {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            conn: Mutex::new(None),
        }
    }

    pub async fn publish(&self, msg: &DataMessage) -> Result<(), BusError> {
        self.send_line(msg.to_string()).await
    }

    pub async fn send_line(&self, line: String) -> Result<(), BusError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            *guard = Some(framed(stream));
        }
        // one reconnect attempt on a stale connection
        if let Some(conn) = guard.as_mut() {
            if conn.send(line.clone()).await.is_ok() {
                return Ok(());
            }
        }
        let stream = TcpStream::connect(&self.addr).await?;
        let mut conn = framed(stream);
        conn.send(line).await?;
        *guard = Some(conn);
        Ok(())
    }
}

/// A data-bus subscription for a fixed set of sensor-name prefixes.
pub struct DataSubscriber {
    frames: Framed<TcpStream, LinesCodec>,
}

impl DataSubscriber {
    pub async fn connect(host: &str, port: u16, topics: &[String]) -> Result<Self, BusError> {
        let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
        let mut frames = framed(stream);
        for topic in topics {
            info!("Listening to {}", topic);
            frames.send(format!("sub {}", topic)).await?;
        }
        Ok(Self { frames })
    }

    /// The next message; `Err(Closed)` when the broker goes away.
    pub async fn recv(&mut self) -> Result<DataMessage, BusError> {
        match self.frames.next().await {
            Some(Ok(line)) => DataMessage::parse(&line),
            Some(Err(e)) => Err(e.into()),
            None => Err(BusError::Closed),
        }
    }
}

/// The data-bus proxy: anything published on the `send` port reaches every
/// matching subscriber on the `recv` port.
pub async fn run_data_proxy(
    send_listener: TcpListener,
    recv_listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) {
    let (fanin_tx, mut fanin_rx) = mpsc::channel::<String>(super::FANOUT_CAPACITY);
    let fanout_tx = fanout_channel();

    let pump_tx = fanout_tx.clone();
    let mut pump_shutdown = shutdown.clone();
    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                line = fanin_rx.recv() => match line {
                    // subscriber count can legitimately be zero
                    Some(line) => {
                        let _ = pump_tx.send(line);
                    }
                    None => break,
                },
                _ = pump_shutdown.changed() => {
                    if *pump_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::join!(
        run_fanin(send_listener, fanin_tx, shutdown.clone()),
        run_fanout(recv_listener, fanout_tx, shutdown),
    );
    pump.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = DataMessage {
            name: "pressure_inner".to_string(),
            time: 1000.125,
            value: Value::Float(3.5),
        };
        let line = msg.to_string();
        assert_eq!(line, "pressure_inner 1000.125 3.5");
        assert_eq!(DataMessage::parse(&line).unwrap(), msg);
    }

    #[test]
    fn test_parse_int_value() {
        let msg = DataMessage::parse("X_SYNC_5 1000.000 0").unwrap();
        assert_eq!(msg.value, Value::Int(0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DataMessage::parse("pressure_inner").is_err());
        assert!(DataMessage::parse("pressure_inner notatime 5").is_err());
    }
}
