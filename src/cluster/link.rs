//! Bidirectional packet links between workers and the coordinator.
//!
//! A [`Link`] is a pair of unbounded channels. In-process links connect the
//! two ends directly; TCP links carry packets as newline-delimited JSON.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use super::message::Packet;

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to connect to coordinator: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Failed to bind coordinator: {0}")]
    Bind(#[source] std::io::Error),
    #[error("Link to the coordinator is closed")]
    Disconnected,
    #[error("No reply from coordinator within {0:?}")]
    Timeout(Duration),
    #[error("Coordinator failed: {0}")]
    Remote(String),
    #[error("Unknown message type {kind:?}")]
    UnknownMessageType {
        key_prefix: Option<String>,
        id: Option<String>,
        kind: String,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// One end of a packet link.
#[derive(Debug)]
pub struct Link {
    tx: UnboundedSender<Packet>,
    rx: UnboundedReceiver<Packet>,
}

impl Link {
    /// Two connected in-process ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }

    /// Connect to a coordinator over TCP.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Link, ClusterError> {
        let stream = TcpStream::connect(addr).await.map_err(ClusterError::Connect)?;
        Ok(Link::from_stream(stream))
    }

    /// Run a link over an established TCP stream.
    ///
    /// Lines that do not parse as packets are skipped. The stream is closed
    /// once both ends of the link have been dropped.
    pub fn from_stream(stream: TcpStream) -> Link {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let (read, mut write) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Packet>();

        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(packet) = out_rx.recv().await {
                let mut line = match serde_json::to_string(&packet) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(peer = %writer_peer, error = %e, "Failed to encode packet");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = write.write_all(line.as_bytes()).await {
                    debug!(peer = %writer_peer, error = %e, "Link write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = LinesStream::new(BufReader::new(read).lines());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Link read failed");
                        break;
                    }
                };
                match serde_json::from_str::<Packet>(&line) {
                    Ok(packet) => {
                        if in_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => trace!(peer = %peer, error = %e, "Skipping unrelated line"),
                }
            }
            debug!(peer = %peer, "Link closed");
        });

        Link { tx: out_tx, rx: in_rx }
    }

    /// Split into the sending and receiving halves.
    pub fn split(self) -> (UnboundedSender<Packet>, UnboundedReceiver<Packet>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn packet(channel: &str) -> Packet {
        Packet {
            channel: channel.to_string(),
            kind: Some("init".to_string()),
            key_prefix: Some("api".to_string()),
            ..Packet::default()
        }
    }

    #[tokio::test]
    async fn test_pair() {
        let (a, b) = Link::pair();
        let (a_tx, mut a_rx) = a.split();
        let (b_tx, mut b_rx) = b.split();

        a_tx.send(packet("one")).unwrap();
        assert_eq!(b_rx.recv().await.unwrap().channel, "one");

        b_tx.send(packet("two")).unwrap();
        assert_eq!(a_rx.recv().await.unwrap().channel, "two");
    }

    #[tokio::test]
    async fn test_tcp_link_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"not json\n{\"unrelated\":true}\n").await.unwrap();
            let line = serde_json::to_string(&packet("ratekeeper")).unwrap();
            stream.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
            stream
        });

        let (_tx, mut rx) = Link::connect(addr).await.unwrap().split();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, packet("ratekeeper"));

        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(Link::connect(addr).await, Err(ClusterError::Connect(_))));
    }
}
