//! # Connection Protocol Engine
//!
//! One [`Connection`] owns a peer's buffers, handshake state and keepalive
//! timers. Every inbound chunk runs [`Connection::process_message`], which
//! drains complete messages until the buffer ends mid-message.
//!
//! ## Processing Loop
//! 1. stop when the connection is no longer alive
//! 2. preview the header and validate it before allocating anything
//! 3. run the type's preview hook, even for a partial message
//! 4. stop and wait when the message is incomplete
//! 5. pop the message, convert it from the peer's version and decode it
//! 6. reject non-handshake traffic before the handshake completes
//! 7. handle it, then reset the bad-message counter
//!
//! ## Error Recovery
//! - **Framing**: close, the next message boundary is unknown
//! - **Resource exhaustion**: returned to the caller
//! - **Validation**: drop exactly that message and count a strike; close if
//!   the message is still incomplete
//! - **Handshake violation**: close without a strike
//! - **Generic**: like validation for a complete message, otherwise close
//!
//! Reaching `max_bad_messages` consecutive strikes closes the connection.

use bytes::Bytes;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::core::buffer::{InputBuffer, OutputBuffer};
use crate::core::codec::{preview_header, HeaderPreview, MessageValidator};
use crate::error::constants::{ERR_PRE_HANDSHAKE_MESSAGE, ERR_UNSUPPORTED_VERSION};
use crate::error::{ErrorClass, RelayError, Result};
use crate::protocol::dispatcher::{Dispatcher, HandlerContext};
use crate::protocol::handshake::{transition, ConnectionState, HandshakeEvent};
use crate::protocol::message::{HelloMessage, Message, PingMessage, PongMessage};
use crate::protocol::versioning::ConverterRegistry;
use crate::service::peers::PeerRegistry;
use crate::service::tx_cache::TxCache;
use crate::transport::{ConnectionId, Direction, PeerEndpoint, Transport};
use crate::utils::metrics::global_metrics;
use crate::utils::scheduler::{Scheduler, TimerEvent, TimerHandle};

/// This node as announced in HELLO messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    pub node_id: Uuid,
    pub network_num: u32,
}

/// Node capabilities handed to each connection.
#[derive(Clone)]
pub struct NodeServices {
    pub identity: LocalIdentity,
    pub scheduler: Arc<dyn Scheduler>,
    pub peers: PeerRegistry,
    pub tx_cache: Arc<Mutex<TxCache>>,
    pub converters: Arc<ConverterRegistry>,
    pub dispatcher: Dispatcher,
}

/// What the processing loop does after a message.
enum Flow {
    Continue,
    Wait,
}

pub struct Connection {
    id: ConnectionId,
    endpoint: PeerEndpoint,
    peer_id: Option<Uuid>,
    network_num: u32,
    peer_protocol_version: u32,
    state: ConnectionState,
    num_bad_messages: u32,
    should_retry: bool,
    inbound: InputBuffer,
    outbound: OutputBuffer,
    transport: Arc<dyn Transport>,
    services: NodeServices,
    config: ConnectionConfig,
    validator: MessageValidator,
    ping_alarm: Option<TimerHandle>,
    pong_timeout_alarm: Option<TimerHandle>,
    close_waiters: Vec<oneshot::Sender<()>>,
    disposed: bool,
}

impl Connection {
    /// Create a connection and queue our HELLO ahead of anything else.
    pub fn new(
        id: ConnectionId,
        endpoint: PeerEndpoint,
        transport: Arc<dyn Transport>,
        services: NodeServices,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let validator = MessageValidator::new(config.max_payload_size);
        let mut conn = Self {
            id,
            endpoint,
            peer_id: None,
            network_num: services.identity.network_num,
            peer_protocol_version: PROTOCOL_VERSION,
            state: ConnectionState::Connecting,
            num_bad_messages: 0,
            should_retry: endpoint.direction == Direction::Outbound,
            inbound: InputBuffer::new(),
            outbound: OutputBuffer::new(),
            transport,
            services,
            config,
            validator,
            ping_alarm: None,
            pong_timeout_alarm: None,
            close_waiters: Vec::new(),
            disposed: false,
        };

        conn.services.peers.register(id, endpoint)?;
        global_metrics().connection_opened();
        info!(conn_id = %id, peer = %endpoint.address, direction = ?endpoint.direction, "Connection created");

        let hello = Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            network_num: conn.services.identity.network_num,
            node_id: conn.services.identity.node_id,
        });
        conn.enqueue_msg(&hello, true)?;
        Ok(conn)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> PeerEndpoint {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.endpoint.direction
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<Uuid> {
        self.peer_id
    }

    pub fn network_num(&self) -> u32 {
        self.network_num
    }

    pub fn peer_protocol_version(&self) -> u32 {
        self.peer_protocol_version
    }

    pub fn num_bad_messages(&self) -> u32 {
        self.num_bad_messages
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    pub fn is_alive(&self) -> bool {
        !self.state.is_closing() && self.transport.is_alive()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Unsent bytes in our buffer plus those still held by the transport.
    pub fn backlog_size(&self) -> usize {
        self.outbound.len() + self.transport.write_buffer_size()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Append socket bytes and process every complete message.
    pub fn process_inbound(&mut self, data: &[u8]) -> Result<()> {
        global_metrics().bytes_read(data.len() as u64);
        self.inbound.append(data);
        self.process_message()
    }

    #[instrument(level = "trace", skip(self), fields(conn_id = %self.id))]
    pub fn process_message(&mut self) -> Result<()> {
        while self.is_alive() {
            let header = match preview_header(self.inbound.as_slice()) {
                Some(header) => header,
                None => break,
            };
            let len_before = self.inbound.len();

            let flow = match self.process_one(&header) {
                Ok(flow) => flow,
                Err(err) => self.recover(err, &header, len_before)?,
            };
            if let Flow::Wait = flow {
                break;
            }
        }

        self.flush()
    }

    fn process_one(&mut self, header: &HeaderPreview) -> Result<Flow> {
        let msg_type = self.validator.validate(header)?;
        self.services
            .dispatcher
            .preview(msg_type, self.id, header, self.inbound.as_slice())?;

        if !header.is_full_message {
            return Ok(Flow::Wait);
        }

        let raw = self.inbound.consume(header.total_len())?;
        let raw = self
            .services
            .converters
            .convert_from_older(raw, self.peer_protocol_version)?;
        let msg = Message::decode(raw)?;
        global_metrics().message_received();

        if !self.state.is_established() && !self.config.handshake_message_types.contains(&msg_type)
        {
            return Err(RelayError::HandshakeViolation(format!(
                "{ERR_PRE_HANDSHAKE_MESSAGE}: {msg_type} in state {}",
                self.state
            )));
        }

        self.handle_message(&msg)?;
        self.num_bad_messages = 0;
        Ok(Flow::Continue)
    }

    fn recover(&mut self, err: RelayError, header: &HeaderPreview, len_before: usize) -> Result<Flow> {
        match err.class() {
            ErrorClass::Framing => {
                global_metrics().framing_error();
                warn!(conn_id = %self.id, error = %err, "Unrecoverable framing error");
                self.mark_for_close(None);
                Ok(Flow::Wait)
            }
            ErrorClass::ResourceExhaustion => Err(err),
            ErrorClass::HandshakeViolation => {
                global_metrics().handshake_violation();
                warn!(conn_id = %self.id, error = %err, "Handshake violation");
                self.mark_for_close(None);
                Ok(Flow::Wait)
            }
            class @ (ErrorClass::Validation | ErrorClass::Generic) => {
                if class == ErrorClass::Validation {
                    global_metrics().validation_error();
                } else {
                    global_metrics().processing_error();
                }

                if header.is_full_message {
                    warn!(conn_id = %self.id, error = %err, "Discarding bad message");
                    if self.inbound.len() == len_before {
                        self.inbound.consume(header.total_len())?;
                    }
                    self.register_bad_message();
                    Ok(Flow::Continue)
                } else {
                    warn!(
                        conn_id = %self.id,
                        error = %err,
                        "Unable to recover from error on incomplete message"
                    );
                    self.mark_for_close(None);
                    Ok(Flow::Wait)
                }
            }
        }
    }

    fn register_bad_message(&mut self) {
        self.num_bad_messages += 1;
        global_metrics().bad_message();
        if self.num_bad_messages >= self.config.max_bad_messages {
            warn!(
                conn_id = %self.id,
                bad_messages = self.num_bad_messages,
                "Too many bad messages, closing connection"
            );
            global_metrics().bad_message_close();
            self.mark_for_close(None);
        }
    }

    fn handle_message(&mut self, msg: &Message) -> Result<()> {
        trace!(conn_id = %self.id, msg_type = %msg.msg_type(), "Handling message");
        match msg {
            Message::Hello(hello) => self.on_hello(hello),
            Message::Ack => self.advance_state(HandshakeEvent::AckReceived),
            Message::Ping(ping) => {
                let pong = Message::Pong(PongMessage { nonce: ping.nonce });
                self.enqueue_msg(&pong, false)
            }
            Message::Pong(_) => {
                self.cancel_pong_timeout();
                Ok(())
            }
            Message::Broadcast(_)
            | Message::Tx(_)
            | Message::GetTxs(_)
            | Message::Txs(_)
            | Message::BlockConfirmation(_)
            | Message::BdnPerformanceStats(_) => self.dispatch(msg),
        }
    }

    fn dispatch(&mut self, msg: &Message) -> Result<()> {
        let mut ctx = HandlerContext::new(
            self.id,
            self.peer_id,
            self.network_num,
            &self.services.tx_cache,
        );
        let handled = self.services.dispatcher.dispatch(&mut ctx, msg)?;
        let replies = ctx.into_replies();

        if !handled {
            debug!(conn_id = %self.id, msg_type = %msg.msg_type(), "No handler registered");
        }
        for reply in &replies {
            self.enqueue_msg(reply, false)?;
        }
        Ok(())
    }

    fn on_hello(&mut self, hello: &HelloMessage) -> Result<()> {
        if hello.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(RelayError::HandshakeViolation(format!(
                "{ERR_UNSUPPORTED_VERSION}: {} < {MIN_PROTOCOL_VERSION}",
                hello.protocol_version
            )));
        }

        self.peer_protocol_version = hello.protocol_version.min(PROTOCOL_VERSION);
        self.network_num = hello.network_num;
        self.peer_id = Some(hello.node_id);

        let duplicates = self.services.peers.index_peer(self.id, hello.node_id)?;
        for duplicate in &duplicates {
            global_metrics().duplicate_connection_closed();
            info!(
                conn_id = %self.id,
                duplicate = %duplicate,
                peer_id = %hello.node_id,
                "Closing older inbound connection from same peer"
            );
        }

        debug!(
            conn_id = %self.id,
            peer_id = %hello.node_id,
            protocol_version = hello.protocol_version,
            network_num = hello.network_num,
            "Received hello"
        );

        self.enqueue_msg(&Message::Ack, false)?;
        self.advance_state(HandshakeEvent::HelloReceived)
    }

    fn advance_state(&mut self, event: HandshakeEvent) -> Result<()> {
        let previous = self.state;
        self.state = transition(previous, event);
        if !previous.is_established() && self.state.is_established() {
            self.on_connection_established()?;
        }
        Ok(())
    }

    fn on_connection_established(&mut self) -> Result<()> {
        global_metrics().handshake_completed();
        if let Err(e) = self.services.peers.reset_retries(self.endpoint.address) {
            warn!(conn_id = %self.id, error = %e, "Failed to reset retry counter");
        }
        info!(
            conn_id = %self.id,
            peer = %self.endpoint.address,
            peer_version = self.peer_protocol_version,
            "Connection established"
        );
        self.schedule_ping()
    }

    fn schedule_ping(&mut self) -> Result<()> {
        if let Some(previous) = self.ping_alarm.take() {
            self.services.scheduler.unregister(previous);
        }
        self.ping_alarm = Some(
            self.services
                .scheduler
                .register(self.config.ping_interval, TimerEvent::SendPing(self.id))?,
        );
        Ok(())
    }

    /// Handle [`TimerEvent::SendPing`].
    pub fn send_ping(&mut self) -> Result<()> {
        self.ping_alarm = None;
        if !self.is_alive() || !self.state.is_established() {
            return Ok(());
        }

        let nonce = rand::rng().random::<u64>();
        self.enqueue_msg(&Message::Ping(PingMessage { nonce }), false)?;
        if self.pong_timeout_alarm.is_none() {
            self.pong_timeout_alarm = Some(
                self.services
                    .scheduler
                    .register(self.config.pong_timeout, TimerEvent::PongTimeout(self.id))?,
            );
        }
        self.schedule_ping()
    }

    /// Handle [`TimerEvent::PongTimeout`].
    pub fn on_pong_timeout(&mut self) {
        self.pong_timeout_alarm = None;
        if self.is_alive() {
            global_metrics().pong_timeout();
            warn!(conn_id = %self.id, "Pong not received in time, closing unresponsive connection");
            self.mark_for_close(None);
        }
    }

    pub fn is_pong_pending(&self) -> bool {
        self.pong_timeout_alarm.is_some()
    }

    fn cancel_pong_timeout(&mut self) {
        if let Some(alarm) = self.pong_timeout_alarm.take() {
            self.services.scheduler.unregister(alarm);
        }
    }

    /// Encode `msg` for the peer's version and queue it.
    ///
    /// `prepend` puts it ahead of queued traffic that has not started sending.
    pub fn enqueue_msg(&mut self, msg: &Message, prepend: bool) -> Result<()> {
        if !self.is_alive() {
            trace!(conn_id = %self.id, msg_type = %msg.msg_type(), "Dropping message for closed connection");
            return Ok(());
        }

        let bytes = self
            .services
            .converters
            .convert_to_older(msg.encode(), self.peer_protocol_version)?;
        self.enqueue_bytes(bytes, prepend)
    }

    /// Queue already-encoded bytes.
    pub fn enqueue_bytes(&mut self, bytes: Bytes, prepend: bool) -> Result<()> {
        global_metrics().message_sent(bytes.len() as u64);
        if prepend {
            self.outbound.prepend(bytes);
        } else {
            self.outbound.append(bytes);
        }
        self.flush()
    }

    /// Hand buffered output to the transport.
    pub fn flush(&mut self) -> Result<()> {
        if self.outbound.is_empty() || !self.transport.is_alive() {
            return Ok(());
        }
        match self.transport.send(&mut self.outbound) {
            Err(err) if err.class() == ErrorClass::ResourceExhaustion => Err(err),
            Err(err) => {
                warn!(conn_id = %self.id, error = %err, "Transport send failed");
                self.mark_for_close(None);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// The transport drained below its high-water mark.
    pub fn on_writable(&mut self) -> Result<()> {
        self.flush()
    }

    /// Stop processing and ask the transport to tear down.
    ///
    /// `should_retry` defaults to whether we opened the connection.
    pub fn mark_for_close(&mut self, should_retry: Option<bool>) {
        if self.state.is_closing() {
            return;
        }
        self.state = transition(self.state, HandshakeEvent::Close);
        self.should_retry = should_retry.unwrap_or(self.endpoint.direction == Direction::Outbound);

        if let Some(alarm) = self.ping_alarm.take() {
            self.services.scheduler.unregister(alarm);
        }
        self.cancel_pong_timeout();

        info!(
            conn_id = %self.id,
            peer = %self.endpoint.address,
            should_retry = self.should_retry,
            "Marking connection for close"
        );
        // Last chance for queued output before the transport tears down.
        if !self.outbound.is_empty() && self.transport.is_alive() {
            if let Err(e) = self.transport.send(&mut self.outbound) {
                debug!(conn_id = %self.id, error = %e, "Final flush failed");
            }
        }
        if !self.outbound.is_empty() {
            debug!(
                conn_id = %self.id,
                dropped_bytes = self.outbound.len(),
                "Dropping output the transport could not take"
            );
        }
        self.transport.mark_for_close(self.should_retry);
    }

    /// Resolves once the transport reports the socket released.
    pub fn wait_closed(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.disposed {
            let _ = tx.send(());
        } else {
            self.close_waiters.push(tx);
        }
        rx
    }

    /// Release everything once the transport confirmed teardown.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if !self.state.is_closing() {
            self.mark_for_close(None);
        }
        self.disposed = true;
        self.inbound.clear();
        self.outbound.clear();
        if let Err(e) = self.services.peers.remove(self.id) {
            warn!(conn_id = %self.id, error = %e, "Failed to unregister connection");
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        global_metrics().connection_disposed();
        debug!(conn_id = %self.id, "Connection disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxCacheConfig;
    use crate::core::codec::HEADER_LEN;
    use crate::protocol::handlers::default_dispatcher;
    use crate::transport::memory::MemoryTransport;
    use crate::utils::scheduler::AlarmQueue;
    use crate::utils::time::ManualClock;
    use std::net::SocketAddr;

    fn services() -> NodeServices {
        let clock = Arc::new(ManualClock::new());
        let alarms = Arc::new(AlarmQueue::new(clock.clone()));
        let tx_cache = TxCache::new(1, TxCacheConfig::default(), clock, alarms.clone());
        NodeServices {
            identity: LocalIdentity {
                node_id: Uuid::from_bytes([9; 16]),
                network_num: 1,
            },
            scheduler: alarms,
            peers: PeerRegistry::new(),
            tx_cache: Arc::new(Mutex::new(tx_cache)),
            converters: Arc::new(ConverterRegistry::with_defaults()),
            dispatcher: default_dispatcher().unwrap(),
        }
    }

    fn connection(direction: Direction) -> (Arc<MemoryTransport>, Connection) {
        let transport = Arc::new(MemoryTransport::new());
        let endpoint = PeerEndpoint {
            address: SocketAddr::from(([127, 0, 0, 1], 9000)),
            direction,
        };
        let conn = Connection::new(
            ConnectionId(1),
            endpoint,
            transport.clone(),
            services(),
            ConnectionConfig::default(),
        )
        .unwrap();
        (transport, conn)
    }

    #[test]
    fn test_hello_sent_on_creation() {
        let (transport, _conn) = connection(Direction::Inbound);
        let written = transport.take_written();
        assert_eq!(&written[..5], b"hello");
        assert_eq!(written.len(), HEADER_LEN + 25);
    }

    #[test]
    fn test_should_retry_defaults_to_outbound() {
        let (transport, mut conn) = connection(Direction::Outbound);
        conn.mark_for_close(None);
        assert!(conn.should_retry());
        assert_eq!(transport.close_requests(), vec![true]);

        let (transport, mut conn) = connection(Direction::Inbound);
        conn.mark_for_close(None);
        conn.mark_for_close(Some(true));
        assert!(!conn.should_retry());
        assert_eq!(transport.close_requests(), vec![false]);
    }

    #[test]
    fn test_close_flushes_queued_output() {
        let (transport, mut conn) = connection(Direction::Inbound);
        transport.take_written();

        transport.set_hold_writes(true);
        conn.enqueue_msg(&Message::Ping(PingMessage { nonce: 4 }), false)
            .unwrap();
        assert_eq!(conn.backlog_size(), HEADER_LEN + 9);
        assert!(transport.take_written().is_empty());

        transport.set_hold_writes(false);
        conn.mark_for_close(None);

        assert_eq!(conn.backlog_size(), 0);
        let written = transport.take_written();
        assert_eq!(&written[..4], b"ping");
        assert_eq!(transport.close_requests(), vec![false]);
    }

    #[test]
    fn test_wait_closed_resolves_on_dispose() {
        let (_transport, mut conn) = connection(Direction::Inbound);
        let mut closed = conn.wait_closed();
        assert!(closed.try_recv().is_err());

        conn.dispose();
        assert!(closed.try_recv().is_ok());
        assert!(conn.wait_closed().try_recv().is_ok());
    }
}
