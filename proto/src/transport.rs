//! The duplex message channel a connection is built on.
//!
//! A [`Transport`] carries whole JSON-RPC messages in both directions and
//! says nothing about where the bytes go. The embedding picks the concrete
//! carrier: a child process's stdio pipes, a TCP socket, or an in-process
//! pair (used by tests and same-process servers). The pipe-backed variants
//! run one reader task and one writer task around the framing codec; the
//! transport is "closed" once the reader task ends and drops its sender.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::{FrameReader, FrameWriter};

/// Queue depth between a connection and the transport tasks.
const CHANNEL_CAPACITY: usize = 64;

/// The peer hung up (or the transport tasks stopped).
#[derive(Debug, thiserror::Error)]
#[error("transport closed")]
pub struct TransportClosed;

/// A bidirectional channel of JSON-RPC messages.
#[derive(Debug)]
pub struct Transport {
    incoming: mpsc::Receiver<Value>,
    outgoing: mpsc::Sender<Value>,
}

impl Transport {
    /// Build a transport from a raw byte reader/writer pair, spawning the
    /// framing tasks. `reader` carries server→client bytes.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut frames = FrameReader::new(reader);
            loop {
                match frames.read_frame().await {
                    Ok(Some(message)) => {
                        if in_tx.send(message).await.is_err() {
                            break; // connection side gone
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("transport stream ended");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("transport read error: {e}");
                        break;
                    }
                }
            }
            // Dropping in_tx closes the incoming channel: the close signal.
        });

        tokio::spawn(async move {
            let mut frames = FrameWriter::new(writer);
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = frames.write_frame(&message).await {
                    tracing::warn!("transport write error: {e}");
                    break;
                }
            }
        });

        Self {
            incoming: in_rx,
            outgoing: out_tx,
        }
    }

    /// Transport over a spawned server's stdio pipes.
    pub fn stdio(
        stdin: tokio::process::ChildStdin,
        stdout: tokio::process::ChildStdout,
    ) -> Self {
        Self::from_io(stdout, stdin)
    }

    /// Transport over a connected TCP socket.
    #[must_use]
    pub fn socket(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::from_io(read_half, write_half)
    }

    /// Two cross-wired in-process transports. What one side sends, the
    /// other receives. Dropping either side closes its peer.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                incoming: a_rx,
                outgoing: b_tx,
            },
            Self {
                incoming: b_rx,
                outgoing: a_tx,
            },
        )
    }

    /// Receive the next inbound message; `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.incoming.recv().await
    }

    /// Send one outbound message.
    pub async fn send(&self, message: Value) -> Result<(), TransportClosed> {
        self.outgoing.send(message).await.map_err(|_| TransportClosed)
    }

    /// Tear the transport apart for a connection to own both directions.
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<Value>, mpsc::Sender<Value>) {
        (self.incoming, self.outgoing)
    }
}
