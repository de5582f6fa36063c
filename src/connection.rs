//! The per-peer connection state machine.
//!
//! Each connection runs one dedicated worker task that owns the socket and all
//!  protocol state: the outbound priority queue, the ack table, fragmentation,
//!  in-order gating, ping/RTT bookkeeping and the fixed-rate send throttle. The
//!  application side talks to the worker exclusively through two bounded
//!  single-producer/single-consumer rings - admission (app to worker) and delivery
//!  (worker to app) - plus a handful of shared tables behind narrow mutexes.
//!
//! Nothing reaches the application by itself: the owner calls
//!  [MessageConnection::process_messages] each tick to drain the delivery ring and
//!  invoke the message handler.

use std::collections::{BTreeMap, BinaryHeap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::bail;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, TransportLayer};
use crate::fragmentation::{split_message, FragmentedReceiveManager, FragmentedSendManager};
use crate::message::{
    is_reserved_message_id, ControlMessage, MessageId, NetworkMessage, QueuedMessage,
    MAX_DATAGRAMS_PER_SECOND, MAX_PRIORITY, MIN_DATAGRAMS_PER_SECOND, MSG_ID_DISCONNECT_ACK,
    NEVER_SEND_PRIORITY,
};
use crate::packet_id::PacketId;
use crate::serialize::{DataDeserializer, DataSerializer};
use crate::socket::ConnectionSocket;
use crate::stats::{ConnectionStatistics, PacketLoss};
use crate::wire::{
    read_stream_message, split_message_content, write_stream_message, DatagramHeader,
    DatagramMessage, FragmentFields, ParsedDatagramMessage, StreamReadResult, MAX_IN_ORDER_DELTA,
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    /// UDP only: nothing has been heard from the peer yet.
    Pending,
    Ok,
    /// Graceful teardown in progress: no new application messages are admitted, the
    ///  queue drains, and the connection waits for the peer's DisconnectAck.
    Disconnecting,
    Closed,
}

/// Application callbacks of one connection. `content_id_for_message` lets the
///  application opt specific message types into content-id based obsolescence; the
///  default opts everything out.
#[cfg_attr(test, automock)]
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, connection: &MessageConnection, id: MessageId, payload: &[u8]);

    fn content_id_for_message(&self, _id: MessageId, _payload: &[u8]) -> Option<u32> {
        None
    }
}

struct ContentIdHolder {
    message_number: u64,
    obsolete: Arc<AtomicBool>,
}

/// State shared between the application side and the worker task. Everything here is
///  either atomic or behind a mutex with narrow critical sections.
struct ConnectionShared {
    config: ConnectionConfig,
    transport: TransportLayer,
    state: StdMutex<ConnectionState>,
    stats: StdMutex<ConnectionStatistics>,
    outbound_content_ids: StdMutex<FxHashMap<(MessageId, u32), ContentIdHolder>>,
    fragmented_sends: StdMutex<FragmentedSendManager>,
    next_message_number: AtomicU64,
    outbound_paused: AtomicBool,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state mutex poisoned")
    }

    fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state == ConnectionState::Closed {
            return;
        }
        if *state != new_state {
            debug!("connection state {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    fn next_message_number(&self) -> u64 {
        self.next_message_number.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Registers an outbound message in the content-id table. Among queued messages
    ///  sharing (id, content id), only the most recently admitted survives: an older
    ///  queued holder is retracted, and a candidate older than the current holder is
    ///  itself admitted already-obsolete.
    fn register_outbound_content_id(&self, msg: &NetworkMessage) {
        if msg.content_id == 0 {
            return;
        }
        let mut table = self.outbound_content_ids.lock().expect("content id mutex poisoned");
        match table.entry((msg.id, msg.content_id)) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if entry.get().message_number < msg.message_number {
                    entry.get().obsolete.store(true, AtomicOrdering::Release);
                    entry.insert(ContentIdHolder {
                        message_number: msg.message_number,
                        obsolete: msg.obsolete_flag(),
                    });
                } else {
                    msg.mark_obsolete();
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(ContentIdHolder {
                    message_number: msg.message_number,
                    obsolete: msg.obsolete_flag(),
                });
            }
        }
    }

    /// Removes the table entry when the message it points to leaves the queue for good.
    ///  Matched via the shared obsolete flag, which fragments inherit from their
    ///  original message.
    fn clear_outbound_content_id(&self, msg: &NetworkMessage) {
        if msg.content_id == 0 {
            return;
        }
        let mut table = self.outbound_content_ids.lock().expect("content id mutex poisoned");
        if let Some(holder) = table.get(&(msg.id, msg.content_id)) {
            if Arc::ptr_eq(&holder.obsolete, &msg.obsolete_flag()) {
                table.remove(&(msg.id, msg.content_id));
            }
        }
    }
}

struct InboundMessage {
    id: MessageId,
    payload: Vec<u8>,
}

/// The application-side handle of one connection. Cheap to share via `Arc`; dropping
///  the last handle aborts the worker task.
pub struct MessageConnection {
    shared: Arc<ConnectionShared>,
    handler: Arc<dyn MessageHandler>,
    admission_tx: mpsc::Sender<Box<NetworkMessage>>,
    delivery_rx: StdMutex<mpsc::Receiver<InboundMessage>>,
    shutdown_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    peer: SocketAddr,
    connection_id: Uuid,
}

impl MessageConnection {
    pub fn new(
        socket: Arc<dyn ConnectionSocket>,
        transport: TransportLayer,
        initial_state: ConnectionState,
        config: ConnectionConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<Arc<MessageConnection>> {
        config.validate()?;

        let peer = socket.peer_addr();
        let connection_id = Uuid::new_v4();
        let (admission_tx, admission_rx) = mpsc::channel(config.admission_queue_capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.delivery_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ConnectionShared {
            stats: StdMutex::new(ConnectionStatistics::new(config.stats_window)),
            config,
            transport,
            state: StdMutex::new(initial_state),
            outbound_content_ids: StdMutex::new(FxHashMap::default()),
            fragmented_sends: StdMutex::new(FragmentedSendManager::new()),
            next_message_number: AtomicU64::new(1),
            outbound_paused: AtomicBool::new(false),
        });

        let worker = ConnectionWorker::new(
            shared.clone(),
            socket,
            handler.clone(),
            delivery_tx,
            connection_id,
        );
        let worker_handle = tokio::spawn(worker.run(admission_rx, shutdown_rx));

        info!("new {:?} connection {} to {} in state {:?}", transport, connection_id, peer, initial_state);

        Ok(Arc::new(MessageConnection {
            shared,
            handler,
            admission_tx,
            delivery_rx: StdMutex::new(delivery_rx),
            shutdown_tx,
            worker: StdMutex::new(Some(worker_handle)),
            peer,
            connection_id,
        }))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Pending | ConnectionState::Ok)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn transport(&self) -> TransportLayer {
        self.shared.transport
    }

    /// Begins building an outbound message. Fill in the payload and delivery flags,
    ///  then hand it to [Self::end_and_queue_message].
    pub fn start_new_message(&self, id: MessageId) -> NetworkMessage {
        NetworkMessage::new(id)
    }

    /// Admits a finished message into the outbound queue. Oversized UDP messages are
    ///  transparently fragmented here; oversized TCP messages are rejected because the
    ///  stream format has no fragment framing and the peer treats a too-long length
    ///  prefix as fatal.
    pub fn end_and_queue_message(&self, mut msg: NetworkMessage) -> anyhow::Result<()> {
        match self.state() {
            ConnectionState::Pending | ConnectionState::Ok => {}
            _ if is_reserved_message_id(msg.id) => {}
            state => {
                warn!("dropping message {} admitted to {} in state {:?}", msg.id, self.peer, state);
                return Ok(());
            }
        }

        let threshold = self.shared.config.fragment_threshold(self.shared.transport);
        if msg.data.len() > threshold {
            if self.shared.transport == TransportLayer::Tcp {
                bail!("message of {} bytes exceeds the TCP message size limit {}", msg.data.len(), threshold);
            }

            msg.message_number = self.shared.next_message_number();
            self.shared.register_outbound_content_id(&msg);
            let fragments = {
                let mut manager = self.shared.fragmented_sends.lock().expect("fragmentation mutex poisoned");
                split_message(&mut manager, msg, threshold)
            };
            // strictly increasing numbers keep the priority queue popping fragments in
            //  index order, so the fragment start reaches the peer first
            for mut fragment in fragments {
                fragment.message_number = self.shared.next_message_number();
                self.admit(fragment);
            }
            return Ok(());
        }

        msg.message_number = self.shared.next_message_number();
        self.shared.register_outbound_content_id(&msg);
        self.admit(msg);
        Ok(())
    }

    fn admit(&self, msg: NetworkMessage) {
        if let Err(e) = self.admission_tx.try_send(Box::new(msg)) {
            warn!("admission queue for {} is full, dropping message: {}", self.peer, e);
        }
    }

    /// Serialize-and-admit convenience for the common case.
    pub fn send_message(
        &self,
        id: MessageId,
        reliable: bool,
        in_order: bool,
        priority: u32,
        content_id: u32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut msg = self.start_new_message(id);
        msg.reliable = reliable;
        msg.in_order = in_order;
        msg.priority = priority;
        msg.content_id = content_id;
        msg.data = payload.to_vec();
        self.end_and_queue_message(msg)
    }

    /// Drains the delivery ring on the calling thread, invoking the message handler
    ///  once per message in arrival order. Returns the number of messages handled.
    pub fn process_messages(&self) -> usize {
        let mut num_processed = 0;
        loop {
            let next = {
                let mut delivery = self.delivery_rx.lock().expect("delivery mutex poisoned");
                delivery.try_recv()
            };
            match next {
                Result::Ok(msg) => {
                    self.handler.handle_message(self, msg.id, &msg.payload);
                    num_processed += 1;
                }
                Err(_) => return num_processed,
            }
        }
    }

    /// Holds back all wire writes so several admissions can be batched; sending
    ///  resumes with [Self::resume_outbound_sends].
    pub fn pause_outbound_sends(&self) {
        self.shared.outbound_paused.store(true, AtomicOrdering::Release);
    }

    pub fn resume_outbound_sends(&self) {
        self.shared.outbound_paused.store(false, AtomicOrdering::Release);
    }

    /// Asks the peer to change its outbound datagram rate. The rate is clamped to the
    ///  protocol bounds on both ends.
    pub fn request_flow_control(&self, datagrams_per_second: u16) -> anyhow::Result<()> {
        let request = ControlMessage::FlowControlRequest {
            datagrams_per_second: datagrams_per_second
                .clamp(MIN_DATAGRAMS_PER_SECOND, MAX_DATAGRAMS_PER_SECOND),
        };
        let mut msg = self.start_new_message(request.message_id());
        msg.data = request.ser();
        msg.reliable = true;
        msg.priority = MAX_PRIORITY - 1;
        self.end_and_queue_message(msg)
    }

    /// Starts a graceful teardown: stop admitting application messages, drain what is
    ///  queued, send Disconnect and wait for the peer's ack. Non-blocking; combine
    ///  with [Self::disconnect_and_wait] or poll [Self::state].
    pub fn disconnect(&self) {
        match self.state() {
            ConnectionState::Disconnecting | ConnectionState::Closed => return,
            _ => {}
        }
        self.shared.set_state(ConnectionState::Disconnecting);

        let mut msg = self.start_new_message(ControlMessage::Disconnect.message_id());
        msg.data = ControlMessage::Disconnect.ser();
        msg.reliable = true;
        msg.priority = MAX_PRIORITY;
        if let Err(e) = self.end_and_queue_message(msg) {
            warn!("could not queue Disconnect for {}: {}", self.peer, e);
        }
    }

    /// Graceful disconnect with a bounded wait, falling back to an immediate close
    ///  when the peer does not ack in time.
    pub async fn disconnect_and_wait(&self) {
        self.disconnect();

        let deadline = Instant::now() + self.shared.config.disconnect_timeout;
        while self.state() != ConnectionState::Closed && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.close().await;
    }

    /// Immediate teardown: signal the worker, wait for it within a bound, abort it as
    ///  a logged last resort.
    pub async fn close(&self) {
        self.shared.set_state(ConnectionState::Closed);
        self.shutdown_tx.send(true).ok();

        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.shared.config.worker_join_timeout, handle).await.is_err() {
                // the shutdown signal stays set, so a straggling worker still winds
                //  down as soon as it reaches its select
                warn!("worker task for {} did not stop within {:?}",
                    self.peer, self.shared.config.worker_join_timeout);
            }
        }
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.shared.stats.lock().expect("stats mutex poisoned").round_trip_time()
    }

    pub fn packet_loss(&self) -> PacketLoss {
        self.shared.stats.lock().expect("stats mutex poisoned").packet_loss(Instant::now())
    }

    /// Logs a condensed status line for this connection at debug level.
    pub fn dump_status(&self) {
        let summary = self.shared.stats.lock().expect("stats mutex poisoned").summary(Instant::now());
        debug!("connection {} to {} [{:?}]: {}", self.connection_id, self.peer, self.state(), summary);
    }
}

impl Drop for MessageConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            handle.abort();
        }
    }
}

/// A reliable packet awaiting its ack: everything needed to resend it faithfully.
struct PacketAckTrack {
    packet_id: PacketId,
    sent_at: Instant,
    resend_count: u32,
    /// The in-order predecessor recorded at first send; resends must repeat it so the
    ///  receiver's gap detector stays consistent.
    previous_in_order: PacketId,
    messages: Vec<Box<NetworkMessage>>,
}

/// A timed-out reliable in-order packet scheduled to go out again under its original
///  packet id.
struct ResendPacket {
    packet_id: PacketId,
    previous_in_order: PacketId,
    resend_count: u32,
    messages: Vec<Box<NetworkMessage>>,
}

/// An inbound in-order packet waiting for its predecessor to be processed.
struct HeldPacket {
    packet_id: PacketId,
    messages: Vec<(MessageId, Vec<u8>)>,
    held_since: Instant,
}

struct ConnectionWorker {
    shared: Arc<ConnectionShared>,
    socket: Arc<dyn ConnectionSocket>,
    handler: Arc<dyn MessageHandler>,
    delivery_tx: mpsc::Sender<InboundMessage>,
    connection_id: Uuid,

    outbound_queue: BinaryHeap<QueuedMessage>,
    ack_tracks: BTreeMap<u32, PacketAckTrack>,
    resend_queue: Vec<ResendPacket>,
    pending_acks: BTreeMap<u32, Instant>,
    fragmented_receives: FragmentedReceiveManager,
    inbound_content_stamps: FxHashMap<(MessageId, u32), (PacketId, Instant)>,
    recent_received_ids: FxHashMap<u32, Instant>,
    in_order_hold: FxHashMap<u32, HeldPacket>,

    next_packet_id: PacketId,
    last_sent_in_order: PacketId,
    last_processed_in_order: PacketId,

    last_heard: Instant,
    outstanding_ping: Option<(u8, Instant)>,
    next_ping_id: u8,

    datagrams_per_second: u16,
    rate_changed: bool,

    tcp_inbound: Vec<u8>,
}

impl ConnectionWorker {
    fn new(
        shared: Arc<ConnectionShared>,
        socket: Arc<dyn ConnectionSocket>,
        handler: Arc<dyn MessageHandler>,
        delivery_tx: mpsc::Sender<InboundMessage>,
        connection_id: Uuid,
    ) -> ConnectionWorker {
        let initial_rate = shared.config.initial_datagrams_per_second;
        ConnectionWorker {
            shared,
            socket,
            handler,
            delivery_tx,
            connection_id,
            outbound_queue: BinaryHeap::new(),
            ack_tracks: BTreeMap::new(),
            resend_queue: Vec::new(),
            pending_acks: BTreeMap::new(),
            fragmented_receives: FragmentedReceiveManager::new(),
            inbound_content_stamps: FxHashMap::default(),
            recent_received_ids: FxHashMap::default(),
            in_order_hold: FxHashMap::default(),
            next_packet_id: PacketId::from_raw(1),
            last_sent_in_order: PacketId::ZERO,
            last_processed_in_order: PacketId::ZERO,
            last_heard: Instant::now(),
            outstanding_ping: None,
            next_ping_id: 0,
            datagrams_per_second: initial_rate,
            rate_changed: false,
            tcp_inbound: Vec::new(),
        }
    }

    fn send_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.datagrams_per_second as f64)
    }

    async fn run(
        mut self,
        mut admission_rx: mpsc::Receiver<Box<NetworkMessage>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let connection_id = self.connection_id;
        debug!("worker for connection {} starting", connection_id);

        let socket = self.socket.clone();
        let mut send_tick = tokio::time::interval_at(
            Instant::now() + self.send_interval(),
            self.send_interval(),
        );
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ping_tick = tokio::time::interval_at(
            Instant::now() + self.shared.config.ping_interval,
            self.shared.config.ping_interval,
        );
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.shared.state() == ConnectionState::Closed {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    break;
                }
                admitted = admission_rx.recv() => {
                    match admitted {
                        Some(msg) => self.accept_outbound_message(msg),
                        None => {
                            debug!("application side of connection {} is gone", connection_id);
                            break;
                        }
                    }
                }
                received = socket.recv() => {
                    match received {
                        Result::Ok(data) => {
                            self.handle_inbound(data);
                            self.drain_buffered_inbound();
                        }
                        Err(e) => {
                            error!("socket error on connection {}: {}", connection_id, e);
                            self.shared.set_state(ConnectionState::Closed);
                        }
                    }
                }
                _ = send_tick.tick() => {
                    self.on_send_tick().await;
                    if self.rate_changed {
                        self.rate_changed = false;
                        send_tick = tokio::time::interval_at(
                            Instant::now() + self.send_interval(),
                            self.send_interval(),
                        );
                        send_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                _ = ping_tick.tick() => {
                    self.on_ping_tick();
                }
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        debug!("worker for connection {} exiting", connection_id);
    }

    /// Reads whatever else the socket has buffered, up to the per-wakeup bound, so a
    ///  burst of datagrams is handled without going back through the event loop.
    fn drain_buffered_inbound(&mut self) {
        for _ in 1..self.shared.config.max_datagrams_per_wakeup {
            match self.socket.try_recv() {
                Result::Ok(Some(data)) => self.handle_inbound(data),
                Result::Ok(None) => return,
                Err(e) => {
                    error!("socket error on connection {}: {}", self.connection_id, e);
                    self.shared.set_state(ConnectionState::Closed);
                    return;
                }
            }
        }
    }

    fn accept_outbound_message(&mut self, msg: Box<NetworkMessage>) {
        trace!("connection {}: queueing outbound message {} (number {})",
            self.connection_id, msg.id, msg.message_number);
        self.outbound_queue.push(QueuedMessage(msg));
    }

    // ---- inbound path -------------------------------------------------------

    fn handle_inbound(&mut self, data: Vec<u8>) {
        self.last_heard = Instant::now();
        if self.shared.state() == ConnectionState::Pending {
            info!("connection {} confirmed by first inbound data", self.connection_id);
            self.shared.set_state(ConnectionState::Ok);
        }

        match self.shared.transport {
            TransportLayer::Udp => self.extract_datagram_messages(data),
            TransportLayer::Tcp => self.extract_stream_messages(data),
        }
    }

    fn extract_datagram_messages(&mut self, data: Vec<u8>) {
        let now = Instant::now();
        let mut reader = DataDeserializer::new(&data);

        let header = match DatagramHeader::deser(&mut reader) {
            Result::Ok(header) => header,
            Err(e) => {
                warn!("malformed {} byte datagram from connection {}: {}", data.len(), self.connection_id, e);
                return;
            }
        };

        let packet_id = header.packet_id;
        if self.recent_received_ids.contains_key(&packet_id.to_raw()) {
            trace!("dropping duplicate datagram {} on connection {}", packet_id, self.connection_id);
            if header.reliable {
                // the peer resent this, so our ack was probably lost - ack it again
                self.pending_acks.entry(packet_id.to_raw()).or_insert(now);
            }
            return;
        }
        self.recent_received_ids.insert(packet_id.to_raw(), now);
        if header.reliable {
            self.pending_acks.insert(packet_id.to_raw(), now);
        }

        let mut messages = Vec::new();
        while reader.bytes_left() > 0 {
            if reader.bytes_left() < 2 {
                warn!("trailing garbage in datagram {} from connection {}", packet_id, self.connection_id);
                break;
            }
            match ParsedDatagramMessage::deser(&mut reader) {
                Result::Ok(msg) => messages.push(msg),
                Err(e) => {
                    warn!("malformed message in datagram {} from connection {}: {}",
                        packet_id, self.connection_id, e);
                    break;
                }
            }
        }

        {
            let mut stats = self.shared.stats.lock().expect("stats mutex poisoned");
            stats.add_packet_in(now, data.len(), messages.len() as u32);
            stats.add_received_packet_id(now, packet_id);
        }

        let mut held_messages = Vec::new();
        for parsed in messages {
            let Some((id, payload)) = self.reassemble(parsed.fragment, parsed.content) else {
                continue;
            };

            if is_reserved_message_id(id) {
                self.handle_control_message(id, &payload);
            } else if parsed.in_order && header.in_order_delta.is_some() {
                held_messages.push((id, payload));
            } else {
                self.dispatch_application_message(Some(packet_id), id, payload);
            }
        }

        if let Some(delta) = header.in_order_delta {
            self.gate_in_order_messages(packet_id, delta, held_messages, now);
        }
    }

    /// Runs a message's content through fragment reassembly if needed, and splits the
    ///  message id off the content. `None` means nothing is deliverable yet.
    fn reassemble(&mut self, fragment: Option<FragmentFields>, content: Vec<u8>) -> Option<(MessageId, Vec<u8>)> {
        let complete = match fragment {
            None => content,
            Some(FragmentFields::Start { transfer_id, total_fragments }) => {
                self.fragmented_receives.new_fragment_start(transfer_id, total_fragments, content);
                return None;
            }
            Some(FragmentFields::Piece { transfer_id, index }) => {
                self.fragmented_receives.fragment_received(transfer_id, index, content)?
            }
        };

        match split_message_content(&complete) {
            Result::Ok((id, payload)) => Some((id, payload.to_vec())),
            Err(e) => {
                warn!("undecodable message id from connection {}: {}", self.connection_id, e);
                None
            }
        }
    }

    /// Decides whether an in-order packet's messages can be processed now or must wait
    ///  for their predecessor. A delta of zero means the sender could not express the
    ///  predecessor, which disables gating for this packet.
    fn gate_in_order_messages(
        &mut self,
        packet_id: PacketId,
        delta: u32,
        messages: Vec<(MessageId, Vec<u8>)>,
        now: Instant,
    ) {
        if delta == 0 {
            for (id, payload) in messages {
                self.dispatch_application_message(Some(packet_id), id, payload);
            }
            self.note_in_order_processed(packet_id);
            return;
        }

        let predecessor = packet_id.sub(delta);
        if predecessor == self.last_processed_in_order
            || !predecessor.is_newer_than(self.last_processed_in_order)
        {
            for (id, payload) in messages {
                self.dispatch_application_message(Some(packet_id), id, payload);
            }
            self.note_in_order_processed(packet_id);
            self.release_held_successors();
        } else {
            trace!("holding in-order packet {} until {} is processed", packet_id, predecessor);
            self.in_order_hold.insert(predecessor.to_raw(), HeldPacket {
                packet_id,
                messages,
                held_since: now,
            });
        }
    }

    fn note_in_order_processed(&mut self, packet_id: PacketId) {
        if packet_id.is_newer_than(self.last_processed_in_order) {
            self.last_processed_in_order = packet_id;
        }
    }

    fn release_held_successors(&mut self) {
        while let Some(held) = self.in_order_hold.remove(&self.last_processed_in_order.to_raw()) {
            trace!("releasing held in-order packet {}", held.packet_id);
            for (id, payload) in held.messages {
                self.dispatch_application_message(Some(held.packet_id), id, payload);
            }
            self.note_in_order_processed(held.packet_id);
        }
    }

    /// In-order gaps do not stall delivery forever: anything held longer than the
    ///  connection-lost timeout is flushed in packet id order. Reliable resends fill
    ///  real gaps long before this bound triggers.
    fn flush_stale_held_packets(&mut self, now: Instant) {
        let timeout = self.shared.config.connection_lost_timeout();
        let has_stale = self.in_order_hold.values()
            .any(|held| now.duration_since(held.held_since) >= timeout);
        if !has_stale {
            return;
        }

        warn!("connection {}: flushing {} in-order packets held past the gap bound",
            self.connection_id, self.in_order_hold.len());
        let mut held: Vec<HeldPacket> = self.in_order_hold.drain().map(|(_, held)| held).collect();
        let reference = self.last_processed_in_order;
        held.sort_by_key(|h| h.packet_id.minus(reference));
        for held in held {
            for (id, payload) in held.messages {
                self.dispatch_application_message(Some(held.packet_id), id, payload);
            }
            self.note_in_order_processed(held.packet_id);
        }
    }

    fn extract_stream_messages(&mut self, data: Vec<u8>) {
        let now = Instant::now();
        self.tcp_inbound.extend_from_slice(&data);
        let mut num_messages = 0u32;

        loop {
            match read_stream_message(&self.tcp_inbound, self.shared.config.tcp_max_message_size) {
                Result::Ok(StreamReadResult::Incomplete) => break,
                Result::Ok(StreamReadResult::Message { consumed, content }) => {
                    self.tcp_inbound.drain(..consumed);
                    num_messages += 1;
                    match split_message_content(&content) {
                        Result::Ok((id, payload)) => {
                            if is_reserved_message_id(id) {
                                self.handle_control_message(id, payload);
                            } else {
                                self.dispatch_application_message(None, id, payload.to_vec());
                            }
                        }
                        Err(e) => {
                            error!("undecodable message id in TCP stream from connection {}: {}",
                                self.connection_id, e);
                            self.shared.set_state(ConnectionState::Closed);
                            return;
                        }
                    }
                }
                Err(e) => {
                    // stream framing is unrecoverable once the length prefix is wrong
                    error!("fatal TCP framing error on connection {}: {}", self.connection_id, e);
                    self.shared.set_state(ConnectionState::Closed);
                    return;
                }
            }
        }

        self.shared.stats.lock().expect("stats mutex poisoned")
            .add_packet_in(now, data.len(), num_messages);
    }

    /// Content-id suppression plus handoff to the delivery ring.
    fn dispatch_application_message(&mut self, packet_id: Option<PacketId>, id: MessageId, payload: Vec<u8>) {
        if let Some(packet_id) = packet_id {
            if let Some(content_id) = self.handler.content_id_for_message(id, &payload) {
                if content_id != 0 && !self.check_inbound_content_stamp(id, content_id, packet_id) {
                    trace!("message {} with content id {} in packet {} is superseded, skipping",
                        id, content_id, packet_id);
                    return;
                }
            }
        }

        if self.delivery_tx.try_send(InboundMessage { id, payload }).is_err() {
            warn!("delivery queue of connection {} is full, dropping inbound message {}",
                self.connection_id, id);
        }
    }

    /// `true` when the message is fresh enough to process. A stamp from a newer packet
    ///  within the forget window means this (id, content id) pair was already
    ///  superseded.
    fn check_inbound_content_stamp(&mut self, id: MessageId, content_id: u32, packet_id: PacketId) -> bool {
        let now = Instant::now();
        let window = self.shared.config.content_id_forget_window;

        if let Some(&(stamped_packet, stamped_at)) = self.inbound_content_stamps.get(&(id, content_id)) {
            if now.duration_since(stamped_at) < window && stamped_packet.is_newer_than(packet_id) {
                return false;
            }
        }
        self.inbound_content_stamps.insert((id, content_id), (packet_id, now));
        true
    }

    fn handle_control_message(&mut self, id: MessageId, payload: &[u8]) {
        let control = match ControlMessage::deser(id, payload) {
            Result::Ok(Some(control)) => control,
            Result::Ok(None) => return,
            Err(e) => {
                warn!("malformed control message {} from connection {}: {}", id, self.connection_id, e);
                return;
            }
        };

        match control {
            ControlMessage::PingRequest { ping_id } => {
                trace!("ping request {} from connection {}", ping_id, self.connection_id);
                self.queue_control_message(ControlMessage::PingReply { ping_id }, false, MAX_PRIORITY - 2);
            }
            ControlMessage::PingReply { ping_id } => {
                match self.outstanding_ping {
                    Some((expected, sent_at)) if expected == ping_id => {
                        let round_trip = Instant::now().duration_since(sent_at);
                        self.outstanding_ping = None;
                        self.shared.stats.lock().expect("stats mutex poisoned")
                            .add_ping(Instant::now(), round_trip, self.shared.config.rtt_blend);
                    }
                    _ => trace!("unmatched ping reply {} from connection {}", ping_id, self.connection_id),
                }
            }
            ControlMessage::FlowControlRequest { datagrams_per_second } => {
                debug!("connection {}: peer requests {} datagrams/s", self.connection_id, datagrams_per_second);
                self.datagrams_per_second = datagrams_per_second;
                self.rate_changed = true;
            }
            ControlMessage::PacketAck { base, sequence } => {
                self.handle_ack(base);
                for bit in 0..32 {
                    if sequence & (1 << bit) != 0 {
                        self.handle_ack(base.plus(bit + 1));
                    }
                }
            }
            ControlMessage::Disconnect => {
                info!("connection {}: peer requests disconnect", self.connection_id);
                self.queue_control_message(ControlMessage::DisconnectAck, false, MAX_PRIORITY);
                self.shared.set_state(ConnectionState::Disconnecting);
            }
            ControlMessage::DisconnectAck => {
                if self.shared.state() == ConnectionState::Disconnecting {
                    info!("connection {}: disconnect acknowledged by peer", self.connection_id);
                    self.shared.set_state(ConnectionState::Closed);
                } else {
                    trace!("stray DisconnectAck from connection {}", self.connection_id);
                }
            }
        }
    }

    fn handle_ack(&mut self, packet_id: PacketId) {
        let Some(track) = self.ack_tracks.remove(&packet_id.to_raw()) else {
            return;
        };
        trace!("connection {}: packet {} acked after {} resends",
            self.connection_id, packet_id, track.resend_count);
        for msg in track.messages {
            self.retire_message(msg);
        }
    }

    /// A message is done with for good: release its fragmentation transfer slot and
    ///  its content-id table entry. For fragments the table entry stays until the last
    ///  sibling retires, so a replacement admitted in between still retracts the rest.
    fn retire_message(&mut self, msg: Box<NetworkMessage>) {
        if let Some(fragment) = msg.fragment {
            let mut manager = self.shared.fragmented_sends.lock().expect("fragmentation mutex poisoned");
            manager.fragment_retired(fragment.transfer_key);
            if manager.total_fragments(fragment.transfer_key).is_some() {
                return;
            }
        }
        self.shared.clear_outbound_content_id(&msg);
    }

    fn queue_control_message(&mut self, control: ControlMessage, reliable: bool, priority: u32) {
        let mut msg = NetworkMessage::new(control.message_id());
        msg.data = control.ser();
        msg.reliable = reliable;
        msg.priority = priority;
        msg.message_number = self.shared.next_message_number();
        self.outbound_queue.push(QueuedMessage(Box::new(msg)));
    }

    // ---- outbound path ------------------------------------------------------

    async fn on_send_tick(&mut self) {
        let now = Instant::now();

        if self.shared.outbound_paused.load(AtomicOrdering::Acquire) {
            return;
        }
        // a Pending client must keep sending - the server's first reply is what
        //  confirms the connection
        if self.shared.state() == ConnectionState::Closed {
            return;
        }

        if self.shared.transport == TransportLayer::Udp {
            self.flush_due_acks(now);
            self.check_resend_timeouts(now);
            self.send_out_datagram(now).await;
        } else {
            self.send_out_stream_data(now).await;
        }
    }

    /// Turns due pending acks into PacketAck messages: one covers a base id plus a
    ///  32-bit run after it. Flushed when the oldest pending ack exceeds the max delay
    ///  or enough have piled up.
    fn flush_due_acks(&mut self, now: Instant) {
        let config = &self.shared.config;
        let oldest_due = self.pending_acks.values()
            .any(|&at| now.duration_since(at) >= config.max_ack_delay);
        if !oldest_due && self.pending_acks.len() < config.max_pending_acks {
            return;
        }

        while let Some((&base_raw, _)) = self.pending_acks.iter().next() {
            self.pending_acks.remove(&base_raw);
            let base = PacketId::from_raw(base_raw);

            let mut sequence = 0u32;
            for bit in 0..32 {
                let id = base.plus(bit + 1);
                if self.pending_acks.remove(&id.to_raw()).is_some() {
                    sequence |= 1 << bit;
                }
            }

            self.queue_control_message(
                ControlMessage::PacketAck { base, sequence },
                false,
                MAX_PRIORITY - 1,
            );
        }
    }

    /// Re-evaluates reliable packets whose ack never arrived: obsolete messages are
    ///  dropped, plain reliable messages go back through the priority queue, and
    ///  in-order messages are scheduled for resending under the original packet id.
    fn check_resend_timeouts(&mut self, now: Instant) {
        let timeout = self.shared.config.reliable_resend_timeout;
        let timed_out: Vec<u32> = self.ack_tracks.iter()
            .filter(|(_, track)| now.duration_since(track.sent_at) >= timeout)
            .map(|(&raw, _)| raw)
            .collect();

        for raw in timed_out {
            let Some(track) = self.ack_tracks.remove(&raw) else { continue };
            debug!("connection {}: reliable packet {} timed out (resend #{})",
                self.connection_id, track.packet_id, track.resend_count + 1);
            self.shared.stats.lock().expect("stats mutex poisoned").add_resend(now);

            let mut in_order_survivors = Vec::new();
            for mut msg in track.messages {
                if msg.is_obsolete() {
                    self.retire_message(msg);
                } else if msg.in_order {
                    in_order_survivors.push(msg);
                } else {
                    msg.send_count += 1;
                    self.outbound_queue.push(QueuedMessage(msg));
                }
            }

            if !in_order_survivors.is_empty() {
                self.resend_queue.push(ResendPacket {
                    packet_id: track.packet_id,
                    previous_in_order: track.previous_in_order,
                    resend_count: track.resend_count + 1,
                    messages: in_order_survivors,
                });
            }
        }
    }

    async fn send_out_datagram(&mut self, now: Instant) {
        // timed-out in-order packets go out first, under their original identity
        if let Some(mut resend) = self.resend_queue.pop() {
            let mut survivors = Vec::new();
            for msg in resend.messages.drain(..) {
                if msg.is_obsolete() {
                    self.retire_message(msg);
                } else {
                    survivors.push(msg);
                }
            }
            if survivors.is_empty() {
                return;
            }
            for msg in &mut survivors {
                msg.send_count += 1;
            }

            let delta = resend.packet_id.minus(resend.previous_in_order);
            let delta = if delta > MAX_IN_ORDER_DELTA { 0 } else { delta };
            let reliable = true;
            match self.serialize_datagram(resend.packet_id, Some(delta), reliable, &survivors) {
                Result::Ok(packet) => {
                    if self.send_packet(&packet, survivors.len() as u32, now).await {
                        self.ack_tracks.insert(resend.packet_id.to_raw(), PacketAckTrack {
                            packet_id: resend.packet_id,
                            sent_at: now,
                            resend_count: resend.resend_count,
                            previous_in_order: resend.previous_in_order,
                            messages: survivors,
                        });
                    }
                }
                Err(e) => error!("connection {}: failed to serialize resend packet: {}", self.connection_id, e),
            }
            return;
        }

        let batch = self.assemble_datagram_batch();
        if batch.is_empty() {
            return;
        }

        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.next();

        let reliable = batch.iter().any(|m| m.reliable);
        let in_order = batch.iter().any(|m| m.in_order);
        let in_order_delta = if in_order {
            let delta = packet_id.minus(self.last_sent_in_order);
            let previous = self.last_sent_in_order;
            self.last_sent_in_order = packet_id;
            Some((if delta > MAX_IN_ORDER_DELTA { 0 } else { delta }, previous))
        } else {
            None
        };

        let packet = match self.serialize_datagram(packet_id, in_order_delta.map(|(d, _)| d), reliable, &batch) {
            Result::Ok(packet) => packet,
            Err(e) => {
                error!("connection {}: failed to serialize datagram: {}", self.connection_id, e);
                for msg in batch {
                    self.retire_message(msg);
                }
                return;
            }
        };

        let sent_disconnect_ack = batch.iter().any(|m| m.id == MSG_ID_DISCONNECT_ACK);

        if !self.send_packet(&packet, batch.len() as u32, now).await {
            return;
        }

        let mut reliable_messages = Vec::new();
        for mut msg in batch {
            msg.send_count += 1;
            if msg.reliable {
                reliable_messages.push(msg);
            } else {
                self.retire_message(msg);
            }
        }
        if !reliable_messages.is_empty() {
            self.ack_tracks.insert(packet_id.to_raw(), PacketAckTrack {
                packet_id,
                sent_at: now,
                resend_count: 0,
                previous_in_order: in_order_delta.map(|(_, prev)| prev).unwrap_or(PacketId::ZERO),
                messages: reliable_messages,
            });
        }

        if sent_disconnect_ack {
            info!("connection {}: DisconnectAck sent, closing", self.connection_id);
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    /// Pulls eligible messages off the priority queue until the datagram is full.
    ///  Obsolete and never-send messages are discarded on the way; fragments whose
    ///  transfer cannot get a wire id yet are set aside and re-queued.
    fn assemble_datagram_batch(&mut self) -> Vec<Box<NetworkMessage>> {
        let mtu = self.shared.config.udp_mtu;
        let header_budget = 3 + 2; // datagram header plus the widest in-order delta
        let mut batch: Vec<Box<NetworkMessage>> = Vec::new();
        let mut blocked_fragments: Vec<QueuedMessage> = Vec::new();
        let mut bytes_used = header_budget;

        while let Some(QueuedMessage(msg)) = self.outbound_queue.pop() {
            if msg.is_obsolete() {
                trace!("connection {}: dropping obsolete message {} before send", self.connection_id, msg.id);
                self.retire_message(msg);
                continue;
            }
            if msg.priority == NEVER_SEND_PRIORITY {
                trace!("connection {}: discarding never-send message {}", self.connection_id, msg.id);
                self.retire_message(msg);
                continue;
            }

            if let Some(fragment) = msg.fragment {
                let allocated = self.shared.fragmented_sends.lock().expect("fragmentation mutex poisoned")
                    .try_allocate_wire_id(fragment.transfer_key);
                if allocated.is_none() {
                    // all 256 transfer ids busy - hold this one back, do not drop it
                    blocked_fragments.push(QueuedMessage(msg));
                    continue;
                }
            }

            let packed_size = self.datagram_message(&msg).packed_size();
            if bytes_used + packed_size > mtu {
                if batch.is_empty() {
                    warn!("connection {}: message {} of {} packed bytes exceeds the MTU, dropping",
                        self.connection_id, msg.id, packed_size);
                    self.retire_message(msg);
                    continue;
                }
                self.outbound_queue.push(QueuedMessage(msg));
                break;
            }
            bytes_used += packed_size;
            batch.push(msg);
        }

        for blocked in blocked_fragments {
            self.outbound_queue.push(blocked);
        }
        batch
    }

    fn datagram_message<'a>(&self, msg: &'a NetworkMessage) -> DatagramMessage<'a> {
        let fragment = msg.fragment.map(|fragment| {
            let mut manager = self.shared.fragmented_sends.lock().expect("fragmentation mutex poisoned");
            let transfer_id = manager.try_allocate_wire_id(fragment.transfer_key)
                .expect("wire id was allocated during batch assembly");
            if fragment.index == 0 {
                FragmentFields::Start {
                    transfer_id,
                    total_fragments: manager.total_fragments(fragment.transfer_key)
                        .expect("live fragment references a live transfer"),
                }
            } else {
                FragmentFields::Piece { transfer_id, index: fragment.index }
            }
        });

        DatagramMessage {
            message_id: if msg.carries_message_id() { Some(msg.id) } else { None },
            payload: &msg.data,
            in_order: msg.in_order,
            fragment,
        }
    }

    fn serialize_datagram(
        &self,
        packet_id: PacketId,
        in_order_delta: Option<u32>,
        reliable: bool,
        messages: &[Box<NetworkMessage>],
    ) -> anyhow::Result<Vec<u8>> {
        let mut writer = DataSerializer::with_capacity(self.shared.config.udp_mtu);
        DatagramHeader { packet_id, reliable, in_order_delta }.ser(&mut writer)?;
        for msg in messages {
            self.datagram_message(msg).ser(&mut writer)?;
        }
        Ok(writer.into_vec())
    }

    /// `false` means the send failed and the connection is now closed.
    async fn send_packet(&mut self, packet: &[u8], num_messages: u32, now: Instant) -> bool {
        if let Err(e) = self.socket.send(packet).await {
            error!("send failed on connection {}: {}", self.connection_id, e);
            self.shared.set_state(ConnectionState::Closed);
            return false;
        }
        self.shared.stats.lock().expect("stats mutex poisoned")
            .add_packet_out(now, packet.len(), num_messages);
        true
    }

    /// TCP: no packet header, no acks - just length-framed messages on the stream.
    async fn send_out_stream_data(&mut self, now: Instant) {
        let mut writer = DataSerializer::new();
        let mut batch: Vec<Box<NetworkMessage>> = Vec::new();

        while let Some(QueuedMessage(msg)) = self.outbound_queue.pop() {
            if msg.is_obsolete() || msg.priority == NEVER_SEND_PRIORITY {
                self.retire_message(msg);
                continue;
            }
            if let Err(e) = write_stream_message(&mut writer, msg.id, &msg.data) {
                error!("connection {}: failed to serialize message {}: {}", self.connection_id, msg.id, e);
                self.retire_message(msg);
                continue;
            }
            batch.push(msg);
            if writer.bytes_filled() >= self.shared.config.tcp_max_message_size {
                break;
            }
        }
        if batch.is_empty() {
            return;
        }

        let sent_disconnect_ack = batch.iter().any(|m| m.id == MSG_ID_DISCONNECT_ACK);
        if !self.send_packet(&writer.into_vec(), batch.len() as u32, now).await {
            return;
        }
        for mut msg in batch {
            msg.send_count += 1;
            // the stream itself is reliable, nothing to track for resending
            self.retire_message(msg);
        }

        if sent_disconnect_ack {
            info!("connection {}: DisconnectAck sent, closing", self.connection_id);
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    // ---- housekeeping -------------------------------------------------------

    fn on_ping_tick(&mut self) {
        let now = Instant::now();

        if now.duration_since(self.last_heard) >= self.shared.config.connection_lost_timeout() {
            warn!("connection {} lost: nothing heard from {} for {:?}",
                self.connection_id, self.socket.peer_addr(), now.duration_since(self.last_heard));
            self.shared.set_state(ConnectionState::Closed);
            return;
        }

        match self.shared.state() {
            ConnectionState::Ok | ConnectionState::Disconnecting => {
                let ping_id = self.next_ping_id;
                self.next_ping_id = self.next_ping_id.wrapping_add(1);
                self.outstanding_ping = Some((ping_id, now));
                self.queue_control_message(ControlMessage::PingRequest { ping_id }, false, MAX_PRIORITY - 2);
            }
            _ => {}
        }

        self.flush_stale_held_packets(now);

        let window = self.shared.config.stats_window;
        self.recent_received_ids.retain(|_, &mut at| now.duration_since(at) < window);
        let forget = self.shared.config.content_id_forget_window;
        self.inbound_content_stamps.retain(|_, &mut (_, at)| now.duration_since(at) < forget);
    }
}
