//! Command-bus clients and message shapes.
//!
//! Workers subscribe to `ping` and their own name on the broker's `recv`
//! port and push replies (`pong`, `ack`) and requests (JSON envelopes or
//! bare hypervisor commands) to the `send` port. The broker delivers
//! addressed commands as `<name> <hash> <command>` lines.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};

use super::{framed, BusError};

/// An addressed command on its way to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub to: String,
    /// Earliest dispatch time, unix seconds; the broker holds the command
    /// until then.
    pub time: f64,
    #[serde(default)]
    pub from: String,
    pub command: String,
}

/// Anything a worker can push onto the broker's ingress port.
#[derive(Debug, Clone, PartialEq)]
pub enum IngressMessage {
    Pong(String),
    Envelope { to: String, time: f64, command: String },
    Ack { name: String, hash: String },
    Bare(String),
}

impl IngressMessage {
    pub fn parse(line: &str) -> Result<Self, BusError> {
        if let Some(name) = line.strip_prefix("pong ") {
            return Ok(IngressMessage::Pong(name.trim().to_string()));
        }
        if line.starts_with('{') {
            let env: CommandEnvelope = serde_json::from_str(line)
                .map_err(|e| BusError::BadMessage(format!("{}: {}", line, e)))?;
            return Ok(IngressMessage::Envelope {
                to: env.to,
                time: env.time,
                command: env.command,
            });
        }
        if let Some(rest) = line.strip_prefix("ack ") {
            let mut parts = rest.split(' ');
            let (Some(name), Some(hash)) = (parts.next(), parts.next()) else {
                return Err(BusError::BadMessage(line.to_string()));
            };
            return Ok(IngressMessage::Ack {
                name: name.to_string(),
                hash: hash.to_string(),
            });
        }
        Ok(IngressMessage::Bare(line.to_string()))
    }
}

/// A command delivered to a worker: `<name> <hash> <command>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub hash: String,
    pub command: String,
}

impl Delivery {
    pub fn parse(line: &str) -> Result<Self, BusError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(_name), Some(hash), Some(command)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BusError::BadMessage(line.to_string()));
        };
        Ok(Self {
            hash: hash.to_string(),
            command: command.to_string(),
        })
    }
}

/// Reconnecting client for the broker's ingress port.
pub struct CommandSender {
    addr: String,
    conn: Mutex<Option<Framed<TcpStream, LinesCodec>>>,
}

impl CommandSender {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            conn: Mutex::new(None),
        }
    }

    pub async fn send_line(&self, line: String) -> Result<(), BusError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            *guard = Some(framed(stream));
        }
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

    pub async fn pong(&self, name: &str) -> Result<(), BusError> {
        self.send_line(format!("pong {}", name)).await
    }

    pub async fn ack(&self, name: &str, hash: &str) -> Result<(), BusError> {
        self.send_line(format!("ack {} {}", name, hash)).await
    }

    pub async fn envelope(&self, envelope: &CommandEnvelope) -> Result<(), BusError> {
        let line = serde_json::to_string(envelope)
            .map_err(|e| BusError::BadMessage(e.to_string()))?;
        self.send_line(line).await
    }
}

/// Subscription to `ping` and this worker's own name on the egress port.
pub struct CommandListener {
    frames: Framed<TcpStream, LinesCodec>,
}

impl CommandListener {
    pub async fn connect(host: &str, port: u16, name: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
        let mut frames = framed(stream);
        frames.send("sub ping".to_string()).await?;
        frames.send(format!("sub {}", name)).await?;
        Ok(Self { frames })
    }

    pub async fn recv(&mut self) -> Result<String, BusError> {
        match self.frames.next().await {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) => Err(e.into()),
            None => Err(BusError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pong() {
        assert_eq!(
            IngressMessage::parse("pong pl_alarm").unwrap(),
            IngressMessage::Pong("pl_alarm".to_string())
        );
    }

    #[test]
    fn test_parse_envelope() {
        let line = r#"{"to": "valve_box", "time": 1000.5, "from": "control_v1", "command": "set v1 1"}"#;
        assert_eq!(
            IngressMessage::parse(line).unwrap(),
            IngressMessage::Envelope {
                to: "valve_box".to_string(),
                time: 1000.5,
                command: "set v1 1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(
            IngressMessage::parse("ack pl_alarm ab12cd").unwrap(),
            IngressMessage::Ack {
                name: "pl_alarm".to_string(),
                hash: "ab12cd".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_bare_command() {
        assert_eq!(
            IngressMessage::parse("manage baratron").unwrap(),
            IngressMessage::Bare("manage baratron".to_string())
        );
    }

    #[test]
    fn test_parse_bad_envelope() {
        assert!(IngressMessage::parse("{not json").is_err());
    }

    #[test]
    fn test_parse_delivery() {
        let delivery = Delivery::parse("pl_control ab12cd pipelinectl_stop control_valve").unwrap();
        assert_eq!(delivery.hash, "ab12cd");
        assert_eq!(delivery.command, "pipelinectl_stop control_valve");
    }
}
