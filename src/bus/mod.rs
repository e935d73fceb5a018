//! Line-oriented TCP buses.
//!
//! The framework runs two logical channels, both brokered by the hypervisor:
//! the data bus (broadcast of sensor samples) and the command bus (addressed
//! requests with hashed acknowledgements). Messages are single ASCII lines;
//! framing is `tokio_util`'s [`LinesCodec`].
//!
//! Fan-in and fan-out building blocks live here; the data proxy is in
//! [`data`], envelope and client types in [`command`].

pub mod command;
pub mod data;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

pub use command::{CommandEnvelope, CommandListener, CommandSender, Delivery, IngressMessage};
pub use data::{DataMessage, DataPublisher, DataSubscriber};

/// Longest accepted bus line.
const MAX_LINE: usize = 8192;

/// Capacity of the broker-side broadcast channels.
const FANOUT_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus framing error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("bus connection closed")]
    Closed,

    #[error("malformed bus message: {0}")]
    BadMessage(String),
}

pub(crate) fn framed(stream: TcpStream) -> Framed<TcpStream, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE))
}

/// Accept producer connections and funnel every line they write into `tx`.
pub async fn run_fanin(
    listener: TcpListener,
    tx: mpsc::Sender<String>,
    shutdown: watch::Receiver<bool>,
) {
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                trace!("Producer connected from {}", peer);
                let tx = tx.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut frames = framed(stream);
                    loop {
                        tokio::select! {
                            line = frames.next() => match line {
                                Some(Ok(line)) => {
                                    if tx.send(line).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!("Dropping producer {}: {}", peer, e);
                                    break;
                                }
                                None => break,
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            _ = accept_shutdown.changed() => {
                if *accept_shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Accept consumer connections and forward matching broadcast lines.
///
/// A consumer declares interest by writing `sub <prefix>` lines; every
/// broadcast line starting with a declared prefix is forwarded to it.
pub async fn run_fanout(
    listener: TcpListener,
    tx: broadcast::Sender<String>,
    shutdown: watch::Receiver<bool>,
) {
    let mut accept_shutdown = shutdown.clone();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                trace!("Consumer connected from {}", peer);
                let mut rx = tx.subscribe();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut frames = framed(stream);
                    let mut prefixes: Vec<String> = Vec::new();
                    loop {
                        tokio::select! {
                            line = frames.next() => match line {
                                Some(Ok(line)) => {
                                    if let Some(topic) = line.strip_prefix("sub ") {
                                        debug!("{} subscribes to '{}'", peer, topic);
                                        prefixes.push(topic.to_string());
                                    }
                                }
                                _ => break,
                            },
                            msg = rx.recv() => match msg {
                                Ok(msg) => {
                                    if prefixes.iter().any(|p| msg.starts_with(p.as_str()))
                                        && frames.send(msg).await.is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    warn!("Consumer {} lagged, dropped {} messages", peer, n);
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
            _ = accept_shutdown.changed() => {
                if *accept_shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// A broadcast channel sized for broker fan-out.
pub fn fanout_channel() -> broadcast::Sender<String> {
    broadcast::channel(FANOUT_CAPACITY).0
}
