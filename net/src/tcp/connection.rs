//! Per-connection state machine.
//!
//! # Architecture
//!
//! A connection is a passive object: it only changes state inside
//! `process_input` (a packet arrived), `on_packet_dropped` (the wire
//! reported a loss), a user call, or a timer callback. Every path that
//! can create send opportunities ends in [`Connection::flush`], which
//! moves staged packets into the wire-ready output queue as far as the
//! effective window and buffer space allow.
//!
//! Sequence-consuming packets (SYN, SYN+ACK, data, our FIN) travel
//! throttled output -> retransmit ledger -> output queue and survive
//! drops. Control replies (pure ACKs, FIN+ACK echoes, RSTs) carry
//! sequence number zero, skip all three queues, and are fire-and-forget.

use std::net::SocketAddrV4;

use log::{debug, trace};
use wraith_lib::time::SimTime;

use crate::buffer::SocketBuffer;
use crate::deps::Dependencies;
use crate::packet::{Packet, TcpFlags, TcpHeader};
use crate::status::SocketStatus;
use crate::tcp::congestion::Congestion;
use crate::tcp::retransmit::RetransmitLedger;
use crate::tcp::seq::{RecvSeq, SendSeq, seq_ge, seq_le, seq_lt};
use crate::tcp::server::{ChildPhase, ChildState, ServerState};
use crate::tcp::staging::SeqQueue;
use crate::tcp::{
    ConnError, ConnFlags, ConnId, ConnectError, RecvError, SendError, TcpConfig, TcpInfo,
    TcpState, Telemetry,
};

// =============================================================================
// Reactions
// =============================================================================

/// Side effects a connection cannot apply to itself because they touch
/// other connections. The table applies them after every call that can
/// raise one.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Reactions {
    /// A child finished its handshake and wants onto its listener's
    /// accept queue.
    pub child_established: bool,
    /// The connection reached Closed and its peers (listener, deps) must
    /// be told.
    pub closed: bool,
}

/// What an inbound ACK amounted to.
struct AckOutcome {
    processed: bool,
    /// Packets newly covered by the cumulative acknowledgment.
    acked: u32,
}

// =============================================================================
// Connection
// =============================================================================

pub(crate) struct Connection {
    pub state: TcpState,
    pub flags: ConnFlags,
    pub error: ConnError,
    pub status: SocketStatus,
    pub config: TcpConfig,
    pub local: Option<SocketAddrV4>,
    pub peer: Option<SocketAddrV4>,

    pub send: SendSeq,
    pub recv: RecvSeq,
    congestion: Congestion,

    /// Sequence-consuming packets waiting for window space.
    pub throttled_output: SeqQueue,
    /// Inbound data waiting for the gap in front of it to fill.
    pub unordered_input: SeqQueue,
    /// In-flight copies, released by cumulative ACKs.
    ledger: RetransmitLedger,
    /// In-order data ready for the application.
    pub input: SocketBuffer,
    /// Wire-ready packets the host pops for transmission.
    pub output: SocketBuffer,
    /// A packet the application consumed only part of, with the offset
    /// already read.
    partial_read: Option<(Packet, usize)>,

    /// Receive window the peer advertised most recently.
    peer_last_window: u32,
    peer_last_seq: u32,
    peer_last_ack: u32,
    /// One outstanding round-trip probe: (sequence, send time). Cleared
    /// on retransmission so a retransmitted packet never skews the sample.
    rtt_probe: Option<(u32, SimTime)>,

    pub telemetry: Telemetry,
    /// Present on listening connections only.
    pub server: Option<ServerState>,
    /// Present on listener-spawned connections only.
    pub child: Option<ChildState>,
}

impl Connection {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            state: TcpState::Closed,
            flags: ConnFlags::empty(),
            error: ConnError::empty(),
            status: SocketStatus::ACTIVE,
            config,
            local: None,
            peer: None,
            send: SendSeq::new(0, config.initial_window),
            recv: RecvSeq::new(config.initial_window),
            congestion: Congestion::new(config.initial_window),
            throttled_output: SeqQueue::new(),
            unordered_input: SeqQueue::new(),
            ledger: RetransmitLedger::new(),
            input: SocketBuffer::new(config.recv_buffer),
            output: SocketBuffer::new(config.send_buffer),
            partial_read: None,
            // Assume the peer can take the initial window until it says
            // otherwise, so the first SYN is not throttled by a zero.
            peer_last_window: config.initial_window.max(1),
            peer_last_seq: 0,
            peer_last_ack: 0,
            rtt_probe: None,
            telemetry: Telemetry::default(),
            server: None,
            child: None,
        }
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Central transition point. Establishment, TimeWait, and Closed all
    /// have entry side effects, so every state change funnels through
    /// here.
    fn set_state<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        new: TcpState,
        reactions: &mut Reactions,
    ) {
        if new == self.state {
            return;
        }
        let old = self.state;
        self.state = new;
        debug!("tcp: {} -> {} id={id:?}", old.name(), new.name());
        match new {
            TcpState::Established => {
                self.flags.insert(ConnFlags::WAS_ESTABLISHED);
                if let Some(sizes) = deps.autotuned_buffer_sizes(id) {
                    self.input.autotune(sizes.receive);
                    self.output.autotune(sizes.send);
                }
                if self.child.is_some() {
                    reactions.child_established = true;
                }
            }
            TcpState::TimeWait => {
                deps.schedule_close_timer(id, self.config.time_wait_delay);
            }
            TcpState::Closed => {
                self.status = SocketStatus::CLOSED;
                reactions.closed = true;
            }
            _ => {}
        }
    }

    // =========================================================================
    // Packet input
    // =========================================================================

    /// Feed one inbound packet through the state machine. Returns true
    /// when the packet could not be absorbed and the sender must treat it
    /// as dropped (and later retransmit it).
    pub fn process_input<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        packet: &Packet,
        reactions: &mut Reactions,
    ) -> bool {
        let header = *packet.header();

        // A reset short-circuits everything, and is never answered.
        if header.is_rst() {
            self.process_reset(deps, id, reactions);
            return false;
        }

        // Listeners remember the addressing of the last packet so a stray
        // segment can be answered with a RST below.
        if let Some(server) = &mut self.server {
            server.remember(header.src, header.dst);
        }

        let mut reply = TcpFlags::empty();
        let mut processed = match self.state {
            TcpState::SynSent => self.syn_sent_input(deps, id, &header, &mut reply, reactions),
            TcpState::SynReceived => {
                self.syn_received_input(deps, id, &header, reactions)
            }
            TcpState::Established => {
                self.established_input(deps, id, &header, &mut reply, reactions)
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => self.teardown_input(deps, id, &header, &mut reply, reactions),
            TcpState::Closed | TcpState::Listen => false,
        };

        // A child that established while the accept queue was full is
        // re-offered on every later packet until the queue has room.
        if self.state == TcpState::Established
            && self.child.is_some_and(|c| c.phase == ChildPhase::Incomplete)
        {
            reactions.child_established = true;
        }

        let ack = self.process_ack(deps, &header);
        processed |= ack.processed;

        if packet.payload_len() > 0 {
            let seq = header.seq;
            if seq_ge(seq, self.recv.next.wrapping_add(self.recv.window)) {
                // Past the advertised window. Refusing it forces the
                // sender to retransmit once the window reopens.
                trace!("tcp: drop seq={seq} outside window id={id:?}");
                return true;
            }
            if seq_lt(seq, self.recv.next) {
                // Duplicate of data already delivered; the forced ACK
                // below re-advertises our position.
                processed = true;
            } else if seq != self.recv.next
                && self.input.space_available() < packet.payload_len()
                && !self.status.contains(SocketStatus::READABLE)
            {
                trace!("tcp: drop seq={seq} no buffer space id={id:?}");
                return true;
            } else {
                self.unordered_input.insert(packet.clone());
                self.telemetry.last_data_received = Some(deps.now());
                processed = true;
            }
        }

        if !processed {
            // Nothing above could make sense of this packet; answer with
            // a reset (but never reset a reset).
            debug!(
                "tcp: unprocessed packet in {} id={id:?} peer seq={} ack={}",
                self.state.name(),
                self.peer_last_seq,
                self.peer_last_ack
            );
            reply = TcpFlags::RST;
        }

        if self.state != TcpState::Listen && self.state != TcpState::Closed {
            self.congestion.on_ack(ack.acked);
            self.flush(deps, id);
            // Acknowledge consumed data and window changes even when no
            // outbound data carried the update.
            if seq_lt(self.send.last_ack_sent, self.recv.next)
                || self.send.last_window_sent != self.recv.window
            {
                reply.insert(TcpFlags::ACK);
            }
        }

        if !reply.is_empty() {
            self.send_control(deps, reply, Some((header.dst, header.src)));
        }
        false
    }

    /// Inbound RST: flag the teardown and park in TimeWait. Listeners,
    /// closed slots, and already-reset connections ignore it.
    fn process_reset<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        reactions: &mut Reactions,
    ) {
        if matches!(self.state, TcpState::Closed | TcpState::Listen)
            || self.flags.contains(ConnFlags::RESET_SIGNALED)
        {
            return;
        }
        debug!("tcp: reset by peer in {} id={id:?}", self.state.name());
        self.error.insert(ConnError::CONNECTION_RESET);
        self.flags
            .insert(ConnFlags::RESET_SIGNALED | ConnFlags::REMOTE_CLOSED);
        self.recv.end = Some(self.recv.next);
        self.status.insert(SocketStatus::READABLE);
        self.status.remove(SocketStatus::WRITABLE);
        self.set_state(deps, id, TcpState::TimeWait, reactions);
    }

    fn syn_sent_input<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        header: &TcpHeader,
        reply: &mut TcpFlags,
        reactions: &mut Reactions,
    ) -> bool {
        if header.is_syn_ack() {
            self.recv.start = header.seq;
            self.recv.next = header.seq.wrapping_add(1);
            reply.insert(TcpFlags::ACK);
            self.set_state(deps, id, TcpState::Established, reactions);
            return true;
        }
        if header.is_syn() {
            // Simultaneous open: both ends sent a SYN before seeing the
            // other's.
            self.recv.start = header.seq;
            self.recv.next = header.seq.wrapping_add(1);
            reply.insert(TcpFlags::ACK);
            self.set_state(deps, id, TcpState::SynReceived, reactions);
            return true;
        }
        false
    }

    fn syn_received_input<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        header: &TcpHeader,
        reactions: &mut Reactions,
    ) -> bool {
        if header.is_syn() && !header.is_ack() {
            // Retransmitted SYN; our SYN+ACK is still in the ledger and
            // will be re-sent if the wire reports it lost.
            return true;
        }
        if header.is_ack()
            && seq_lt(self.send.unacked, header.ack)
            && seq_le(header.ack, self.send.next)
        {
            self.set_state(deps, id, TcpState::Established, reactions);
            return true;
        }
        false
    }

    fn established_input<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        header: &TcpHeader,
        reply: &mut TcpFlags,
        reactions: &mut Reactions,
    ) -> bool {
        if header.is_stream_fin() {
            self.register_peer_fin(header.seq);
            reply.insert(TcpFlags::FIN | TcpFlags::ACK);
            self.set_state(deps, id, TcpState::CloseWait, reactions);
            return true;
        }
        // Plain data and ACKs are handled by the common path.
        false
    }

    /// Input for every state past Established. CloseWait is included for
    /// its duplicate-FIN handling; its data path stays the common one.
    fn teardown_input<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        header: &TcpHeader,
        reply: &mut TcpFlags,
        reactions: &mut Reactions,
    ) -> bool {
        let fin_acked = header.is_ack()
            && self.send.end.is_some_and(|end| seq_ge(header.ack, end));

        if header.is_stream_fin() {
            match self.state {
                TcpState::FinWait1 => {
                    self.register_peer_fin(header.seq);
                    reply.insert(TcpFlags::FIN | TcpFlags::ACK);
                    // If this FIN also acknowledges ours, both directions
                    // are done.
                    let next = if fin_acked {
                        TcpState::TimeWait
                    } else {
                        TcpState::Closing
                    };
                    self.set_state(deps, id, next, reactions);
                }
                TcpState::FinWait2 => {
                    self.register_peer_fin(header.seq);
                    reply.insert(TcpFlags::FIN | TcpFlags::ACK);
                    self.set_state(deps, id, TcpState::TimeWait, reactions);
                }
                TcpState::CloseWait
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait => {
                    // Duplicate FIN: our earlier FIN+ACK was lost, repeat
                    // it.
                    reply.insert(TcpFlags::FIN | TcpFlags::ACK);
                }
                _ => {}
            }
            return true;
        }

        if fin_acked {
            match self.state {
                TcpState::FinWait1 => self.set_state(deps, id, TcpState::FinWait2, reactions),
                TcpState::Closing => self.set_state(deps, id, TcpState::TimeWait, reactions),
                TcpState::LastAck => self.set_state(deps, id, TcpState::Closed, reactions),
                _ => {}
            }
            return true;
        }
        false
    }

    /// Record the peer's FIN and consume its sequence number if the
    /// stream is already complete up to it.
    fn register_peer_fin(&mut self, seq: u32) {
        self.flags.insert(ConnFlags::REMOTE_CLOSED);
        self.recv.end = Some(seq);
        self.consume_fin_if_next();
    }

    /// A FIN occupies one sequence number, consumed exactly when it
    /// becomes the next expected one. Until then acknowledgments stop
    /// short of it.
    fn consume_fin_if_next(&mut self) {
        if self.flags.contains(ConnFlags::RESET_SIGNALED) {
            return;
        }
        if let Some(end) = self.recv.end
            && self.recv.next == end
        {
            self.recv.next = end.wrapping_add(1);
        }
    }

    /// Cumulative-ACK processing, shared by every state. The peer's
    /// advertised window and positions always refresh, valid ACK or not.
    fn process_ack<D: Dependencies>(&mut self, deps: &mut D, header: &TcpHeader) -> AckOutcome {
        let mut processed = false;
        let mut acked = 0u32;
        if header.is_ack() {
            if seq_lt(self.send.unacked, header.ack) && seq_le(header.ack, self.send.next) {
                acked = header.ack.wrapping_sub(self.send.unacked);
                self.ledger.release_range(self.send.unacked, header.ack);
                self.send.unacked = header.ack;
                self.sample_rtt(deps, header.ack);
                self.telemetry.last_ack_received = Some(deps.now());
                processed = true;
            } else if header.seq == 0
                && !matches!(self.state, TcpState::Listen | TcpState::Closed)
            {
                // Duplicate or window-update ACK on a live conversation;
                // benign either way. On a listener or a closed slot the
                // same packet is a stray and earns a RST instead.
                processed = true;
            }
        }
        self.peer_last_window = header.window;
        self.peer_last_seq = header.seq;
        self.peer_last_ack = header.ack;
        AckOutcome { processed, acked }
    }

    fn sample_rtt<D: Dependencies>(&mut self, deps: &mut D, ack: u32) {
        if let Some((seq, sent_at)) = self.rtt_probe
            && seq_lt(seq, ack)
        {
            self.telemetry.rtt = Some(deps.now().duration_since(sent_at));
            self.rtt_probe = None;
        }
    }

    // =========================================================================
    // Output pipeline
    // =========================================================================

    /// Move staged packets toward the wire as far as windows and buffer
    /// space allow, deliver reordered input that became contiguous, and
    /// refresh EOF and readiness bits. Idempotent; called after anything
    /// that may have created room.
    pub fn flush<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) {
        if matches!(self.state, TcpState::Closed | TcpState::Listen) {
            return;
        }

        // Advertised window tracks the space left in the input buffer.
        let space = self.input.space_available();
        self.recv.window = (space / self.config.mss) as u32;
        if self.recv.window == 0 {
            debug_assert!(!self.input.is_empty());
        }

        self.send.window = self.congestion.window().min(self.peer_last_window);
        trace!(
            "tcp: flush id={id:?} window={} in_flight={} staged={}",
            self.send.window,
            self.send.in_flight(),
            self.throttled_output.len()
        );

        // Drain throttled output through the effective window.
        loop {
            let Some(head) = self.throttled_output.peek() else {
                break;
            };
            let seq = head.seq();
            let payload_len = head.payload_len();
            let is_syn = head.header().is_syn();
            if !seq_lt(seq, self.send.unacked.wrapping_add(self.send.window)) {
                break;
            }
            if payload_len > self.output.space_available() {
                break;
            }
            let Some(packet) = self.throttled_output.pop() else {
                break;
            };
            // SYN and SYN+ACK keep their creation-time header; restamping
            // would add an ACK flag the handshake must not carry.
            let packet = if is_syn {
                packet
            } else {
                packet
                    .restamp()
                    .ack(self.recv.next)
                    .window(self.recv.window)
                    .finish()
            };
            let header = *packet.header();
            self.ledger.record(packet.clone());
            if self.rtt_probe.is_none() {
                self.rtt_probe = Some((seq, deps.now()));
            }
            if header.is_ack() {
                self.send.last_ack_sent = header.ack;
                self.telemetry.last_ack_sent = Some(deps.now());
            }
            self.send.last_window_sent = header.window;
            if payload_len > 0 {
                self.telemetry.last_data_sent = Some(deps.now());
            }
            let pushed = self.output.push(packet);
            debug_assert!(pushed);
        }

        // Deliver reordered input that has become contiguous.
        loop {
            let Some(head) = self.unordered_input.peek() else {
                break;
            };
            if head.seq() != self.recv.next {
                break;
            }
            let Some(packet) = self.unordered_input.pop() else {
                break;
            };
            if self.input.push(packet.clone()) {
                self.recv.next = self.recv.next.wrapping_add(1);
            } else {
                self.unordered_input.insert(packet);
                break;
            }
        }
        self.consume_fin_if_next();

        // End of stream: the peer closed and everything up to its FIN has
        // been received.
        if self.flags.contains(ConnFlags::REMOTE_CLOSED)
            && let Some(end) = self.recv.end
            && seq_ge(self.recv.next, end)
        {
            self.error.insert(ConnError::RECV_EOF);
        }

        self.update_readiness();
        deps.record_buffer_occupancy(id, self.input.len_bytes(), self.input.capacity());
        self.send.check();
        self.recv.check();
    }

    fn update_readiness(&mut self) {
        let readable = !self.input.is_empty()
            || self.partial_read.is_some()
            || self
                .error
                .intersects(ConnError::RECV_EOF | ConnError::CONNECTION_RESET);
        self.status.set(SocketStatus::READABLE, readable);
        let writable = self.state.can_send()
            && !self.flags.contains(ConnFlags::LOCAL_CLOSED)
            && self.send_space() > 0;
        self.status.set(SocketStatus::WRITABLE, writable);
    }

    /// Bytes of new user data the send pipeline can take right now.
    /// Staged and in-flight payload counts against the same budget as the
    /// wire-ready queue.
    fn send_space(&self) -> usize {
        self.output
            .space_available()
            .saturating_sub(self.throttled_output.bytes() + self.ledger.bytes())
    }

    /// Emit a fire-and-forget control packet. Sequence number zero marks
    /// it as consuming no sequence space; it is never ledgered and never
    /// retransmitted.
    ///
    /// Listeners answer to the remembered source of their last packet;
    /// unbound slots (a stray segment to a closed connection) fall back
    /// to `reply_to`.
    fn send_control<D: Dependencies>(
        &mut self,
        deps: &mut D,
        flags: TcpFlags,
        reply_to: Option<(SocketAddrV4, SocketAddrV4)>,
    ) {
        let (local, peer) = match &self.server {
            Some(server) => (server.last_local(), server.last_peer()),
            None => (self.local, self.peer),
        };
        let (local, peer) = match (local, peer) {
            (Some(local), Some(peer)) => (local, peer),
            _ => match reply_to {
                Some(addrs) => addrs,
                None => return,
            },
        };
        let packet = Packet::control(local, peer, flags, 0, self.recv.next, self.recv.window);
        if flags.contains(TcpFlags::ACK) {
            self.send.last_ack_sent = self.recv.next;
            self.telemetry.last_ack_sent = Some(deps.now());
        }
        self.send.last_window_sent = self.recv.window;
        let pushed = self.output.push(packet);
        debug_assert!(pushed);
    }

    // =========================================================================
    // Loss handling
    // =========================================================================

    /// The wire reported one of our packets dropped. Control packets and
    /// anything already acknowledged are not in the ledger and need no
    /// recovery.
    pub fn on_packet_dropped<D: Dependencies>(&mut self, deps: &mut D, id: ConnId, packet: &Packet) {
        if self.state == TcpState::Closed {
            return;
        }
        let seq = packet.seq();
        let Some(stored) = self.ledger.take(seq) else {
            return;
        };
        debug!("tcp: retransmit seq={seq} id={id:?}");
        self.congestion.on_loss();
        self.telemetry.retransmit_count += 1;
        if self.rtt_probe.is_some_and(|(probe, _)| probe == seq) {
            // Karn: a retransmitted packet cannot give a clean sample.
            self.rtt_probe = None;
        }
        // Sorted insertion puts it back ahead of anything newer.
        self.throttled_output.insert(stored);
        self.flush(deps, id);
    }

    // =========================================================================
    // User calls
    // =========================================================================

    /// Start the active side of the handshake. Success is reported as
    /// `InProgress`; completion is observed via `connect_error`.
    pub fn connect<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<(), ConnectError> {
        if self.server.is_some() {
            return Err(ConnectError::Invalid);
        }
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => {
                return Err(ConnectError::AlreadyInProgress);
            }
            TcpState::Closed if !self.flags.contains(ConnFlags::LOCAL_CLOSED) => {}
            _ if self.flags.contains(ConnFlags::WAS_ESTABLISHED) => {
                return Err(ConnectError::AlreadyConnected);
            }
            _ => return Err(ConnectError::Invalid),
        }
        self.local = Some(local);
        self.peer = Some(peer);
        self.recv.window = (self.input.space_available() / self.config.mss) as u32;
        let seq = self.send.next;
        self.send.next = self.send.next.wrapping_add(1);
        // The SYN's header is final at creation; flush never restamps it.
        let syn = Packet::control(local, peer, TcpFlags::SYN, seq, 0, self.recv.window);
        self.throttled_output.insert(syn);
        let mut reactions = Reactions::default();
        self.set_state(deps, id, TcpState::SynSent, &mut reactions);
        self.flush(deps, id);
        Err(ConnectError::InProgress)
    }

    /// Result a non-blocking connect would report right now, in the
    /// manner of `getsockopt(SO_ERROR)`.
    pub fn connect_error(&self) -> Option<ConnectError> {
        if self.error.contains(ConnError::CONNECTION_RESET) {
            return Some(if self.flags.contains(ConnFlags::WAS_ESTABLISHED) {
                ConnectError::Reset
            } else {
                ConnectError::Refused
            });
        }
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => Some(ConnectError::InProgress),
            TcpState::Closed if !self.flags.contains(ConnFlags::WAS_ESTABLISHED) => {
                Some(ConnectError::NotConnected)
            }
            _ => None,
        }
    }

    /// Become a child of `parent`, answering an inbound SYN.
    pub fn accept_syn<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        parent: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
        syn: &TcpHeader,
    ) {
        self.child = Some(ChildState::new(parent));
        self.local = Some(local);
        self.peer = Some(peer);
        self.recv.start = syn.seq;
        self.recv.next = syn.seq.wrapping_add(1);
        self.recv.window = (self.input.space_available() / self.config.mss) as u32;
        self.peer_last_window = syn.window.max(1);
        self.peer_last_seq = syn.seq;
        self.peer_last_ack = syn.ack;
        let seq = self.send.next;
        self.send.next = self.send.next.wrapping_add(1);
        let syn_ack = Packet::control(
            local,
            peer,
            TcpFlags::SYN | TcpFlags::ACK,
            seq,
            self.recv.next,
            self.recv.window,
        );
        self.throttled_output.insert(syn_ack);
        let mut reactions = Reactions::default();
        self.set_state(deps, id, TcpState::SynReceived, &mut reactions);
        self.flush(deps, id);
    }

    /// Queue user bytes for transmission, chunked into packets of at most
    /// one MSS, each consuming one sequence number.
    pub fn send_user_data<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        buf: &[u8],
    ) -> Result<usize, SendError> {
        if self.error.contains(ConnError::CONNECTION_RESET) {
            return Err(SendError::Reset);
        }
        if self.flags.contains(ConnFlags::LOCAL_CLOSED) || self.error.contains(ConnError::SEND_EOF)
        {
            return Err(SendError::Eof);
        }
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => return Err(SendError::WouldBlock),
            state if state.can_send() => {}
            _ => return Err(SendError::Eof),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let (Some(local), Some(peer)) = (self.local, self.peer) else {
            return Err(SendError::Eof);
        };
        let space = self.send_space();
        if space == 0 {
            return Err(SendError::WouldBlock);
        }
        let allowed = space.min(buf.len());
        let mut offset = 0;
        while offset < allowed {
            let chunk = (allowed - offset).min(self.config.mss);
            let seq = self.send.next;
            self.send.next = self.send.next.wrapping_add(1);
            self.throttled_output
                .insert(Packet::data(local, peer, seq, &buf[offset..offset + chunk]));
            offset += chunk;
        }
        self.flush(deps, id);
        Ok(offset)
    }

    /// Copy received in-order bytes to the caller. A packet consumed only
    /// partially is parked and resumed on the next call.
    pub fn receive_user_data<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        buf: &mut [u8],
    ) -> Result<usize, RecvError> {
        let mut copied = 0usize;

        if let Some((packet, offset)) = self.partial_read.take() {
            let n = packet.copy_payload(offset, buf);
            copied += n;
            if offset + n < packet.payload_len() {
                self.partial_read = Some((packet, offset + n));
            }
        }
        while copied < buf.len() {
            let Some(packet) = self.input.pop() else {
                break;
            };
            let n = packet.copy_payload(0, &mut buf[copied..]);
            copied += n;
            if n < packet.payload_len() {
                self.partial_read = Some((packet, n));
            }
        }

        if copied > 0 {
            self.flush(deps, id);
            // Reads are the only thing that reopens a closed window, and
            // no inbound packet is in hand to trigger the advertisement,
            // so send it directly.
            if self.send.last_window_sent == 0 && self.recv.window > 0 {
                self.send_control(deps, TcpFlags::ACK, None);
            }
            return Ok(copied);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let reset = self.error.contains(ConnError::CONNECTION_RESET);
        if reset || self.error.contains(ConnError::RECV_EOF) {
            // EOF is reported once as a zero-length read, then as an
            // error.
            if !self.flags.contains(ConnFlags::EOF_SIGNALED) {
                self.flags.insert(ConnFlags::EOF_SIGNALED);
                self.update_readiness();
                return Ok(0);
            }
            return Err(if reset { RecvError::Reset } else { RecvError::Eof });
        }
        Err(RecvError::WouldBlock)
    }

    /// Close the sending direction. Idempotent; listener close lives in
    /// the table because it sweeps children.
    pub fn close<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        reactions: &mut Reactions,
    ) {
        if self.flags.contains(ConnFlags::LOCAL_CLOSED) {
            return;
        }
        self.flags.insert(ConnFlags::LOCAL_CLOSED);
        match self.state {
            TcpState::Established => {
                self.queue_fin(deps, id);
                self.set_state(deps, id, TcpState::FinWait1, reactions);
            }
            TcpState::CloseWait => {
                self.queue_fin(deps, id);
                self.set_state(deps, id, TcpState::LastAck, reactions);
            }
            TcpState::SynSent | TcpState::SynReceived | TcpState::Closed => {
                // Abandon before establishment. Any straggling handshake
                // packet will be answered with a RST from the closed
                // state.
                self.status = SocketStatus::CLOSED;
                self.set_state(deps, id, TcpState::Closed, reactions);
            }
            // Teardown already runs; listeners never reach here.
            _ => debug_assert!(self.state.is_teardown()),
        }
    }

    /// Stage our FIN. It consumes a sequence number, rides the normal
    /// send pipeline behind any queued data, and is retransmitted like
    /// data if dropped.
    fn queue_fin<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) {
        let (Some(local), Some(peer)) = (self.local, self.peer) else {
            return;
        };
        self.error.insert(ConnError::SEND_EOF);
        let seq = self.send.next;
        self.send.next = self.send.next.wrapping_add(1);
        self.send.end = Some(self.send.next);
        let fin = Packet::control(local, peer, TcpFlags::FIN, seq, 0, 0);
        self.throttled_output.insert(fin);
        self.flush(deps, id);
    }

    /// TimeWait expiry. Stale timers for a connection that has moved on
    /// are ignored.
    pub fn on_close_timer_expired<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        reactions: &mut Reactions,
    ) {
        if self.state != TcpState::TimeWait {
            return;
        }
        self.set_state(deps, id, TcpState::Closed, reactions);
    }

    pub fn info(&self) -> TcpInfo {
        TcpInfo {
            state: self.state,
            rtt: self.telemetry.rtt,
            retransmit_count: self.telemetry.retransmit_count,
            last_data_sent: self.telemetry.last_data_sent,
            last_ack_sent: self.telemetry.last_ack_sent,
            last_data_received: self.telemetry.last_data_received,
            last_ack_received: self.telemetry.last_ack_received,
        }
    }
}
