//! TCP transport.
//!
//! Each socket gets a reader task and a writer task. The reader forwards raw
//! chunks to the node loop; message framing stays in the connection engine.
//! The writer drains an unbounded command queue, so a close request is only
//! honoured after every write queued before it has been flushed.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, instrument, warn};

use crate::core::buffer::OutputBuffer;
use crate::error::{RelayError, Result};
use crate::transport::{ConnectionId, NodeEvent, Transport};

#[derive(Debug)]
enum WriterCommand {
    Data(Bytes),
    Close { should_retry: bool },
}

/// Socket side of one connection.
#[derive(Debug)]
pub struct TcpTransport {
    conn_id: ConnectionId,
    commands: mpsc::UnboundedSender<WriterCommand>,
    alive: Arc<AtomicBool>,
    /// Bytes queued for the writer task but not yet written.
    pending: Arc<AtomicUsize>,
    high_water: usize,
}

impl TcpTransport {
    /// Split `stream` and start its reader and writer tasks.
    pub fn spawn(
        stream: TcpStream,
        conn_id: ConnectionId,
        events: mpsc::UnboundedSender<NodeEvent>,
        high_water: usize,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%conn_id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));

        let reader = tokio::spawn(read_loop(
            conn_id,
            FramedRead::new(read_half, BytesCodec::new()),
            events.clone(),
        ));
        tokio::spawn(write_loop(
            WriterState {
                conn_id,
                alive: alive.clone(),
                pending: pending.clone(),
                high_water,
                events,
                reader,
            },
            FramedWrite::new(write_half, BytesCodec::new()),
            commands_rx,
        ));

        Arc::new(Self {
            conn_id,
            commands: commands_tx,
            alive,
            pending,
            high_water,
        })
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }
}

impl Transport for TcpTransport {
    fn send(&self, buffer: &mut OutputBuffer) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        while self.pending.load(Ordering::Acquire) < self.high_water {
            let chunk = match buffer.get_buffer() {
                Some(chunk) => chunk,
                None => break,
            };
            let len = chunk.len();
            self.pending.fetch_add(len, Ordering::AcqRel);
            if self.commands.send(WriterCommand::Data(chunk)).is_err() {
                self.alive.store(false, Ordering::Release);
                return Err(RelayError::ConnectionClosed);
            }
            buffer.advance(len)?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn write_buffer_size(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn mark_for_close(&self, should_retry: bool) {
        self.alive.store(false, Ordering::Release);
        // Writer already gone means disposal is on its way.
        let _ = self.commands.send(WriterCommand::Close { should_retry });
    }
}

struct WriterState {
    conn_id: ConnectionId,
    alive: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    high_water: usize,
    events: mpsc::UnboundedSender<NodeEvent>,
    reader: JoinHandle<()>,
}

#[instrument(level = "debug", skip(reader, events))]
async fn read_loop(
    conn_id: ConnectionId,
    mut reader: FramedRead<OwnedReadHalf, BytesCodec>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(data) => {
                let event = NodeEvent::Received {
                    conn_id,
                    data: data.freeze(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(%conn_id, error = %e, "Socket read failed");
                break;
            }
        }
    }
    let _ = events.send(NodeEvent::PeerClosed(conn_id));
}

async fn write_loop(
    state: WriterState,
    mut writer: FramedWrite<OwnedWriteHalf, BytesCodec>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    let conn_id = state.conn_id;
    let mut should_retry = false;

    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Data(data) => {
                let len = data.len();
                let result = writer.send(data).await;
                let before = state.pending.fetch_sub(len, Ordering::AcqRel);

                if let Err(e) = result {
                    warn!(%conn_id, error = %e, "Socket write failed");
                    break;
                }
                if before >= state.high_water && before - len < state.high_water {
                    let _ = state.events.send(NodeEvent::Writable(conn_id));
                }
            }
            WriterCommand::Close {
                should_retry: retry,
            } => {
                should_retry = retry;
                break;
            }
        }
    }

    state.alive.store(false, Ordering::Release);
    if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
        debug!(%conn_id, error = %e, "Socket shutdown failed");
    }
    state.reader.abort();
    debug!(%conn_id, "Socket released");
    let _ = state.events.send(NodeEvent::Disposed {
        conn_id,
        should_retry,
    });
}
