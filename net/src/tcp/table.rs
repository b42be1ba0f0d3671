//! Connection table: the arena behind every [`ConnId`] and the entire
//! host-facing API.
//!
//! The table owns the connections; hosts hold opaque handles and drive
//! everything through `&mut self` calls, passing their [`Dependencies`]
//! implementation into each one. Cross-connection effects (spawning a
//! child for a SYN, promoting an established child onto its listener's
//! accept queue, tearing a closed child out of the listener) are applied
//! here, where both ends of the link are reachable.

use std::net::SocketAddrV4;

use log::debug;
use slotmap::SlotMap;

use crate::deps::Dependencies;
use crate::packet::{Packet, TcpHeader};
use crate::status::SocketStatus;
use crate::tcp::connection::{Connection, Reactions};
use crate::tcp::server::{ChildPhase, ServerState};
use crate::tcp::{
    AcceptError, ConnFlags, ConnId, ConnectError, RecvError, SendError, TcpConfig, TcpError,
    TcpInfo, TcpState,
};

pub struct ConnTable {
    conns: SlotMap<ConnId, Connection>,
    config: TcpConfig,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::with_config(TcpConfig::default())
    }

    pub fn with_config(config: TcpConfig) -> Self {
        Self {
            conns: SlotMap::with_key(),
            config,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Allocate a fresh connection slot.
    pub fn open(&mut self) -> ConnId {
        self.conns.insert(Connection::new(self.config))
    }

    /// Free a slot. The handle is dead afterwards; a listening parent, if
    /// any, forgets the connection so the peer's address slot can be
    /// reused.
    pub fn release(&mut self, id: ConnId) -> Result<(), TcpError> {
        let conn = self.conns.remove(id).ok_or(TcpError::NotFound)?;
        if let Some(child) = conn.child
            && let Some(peer) = conn.peer
            && let Some(parent) = self.conns.get_mut(child.parent)
            && let Some(server) = parent.server.as_mut()
        {
            server.forget_child(peer);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Every live handle, listeners and hidden children included. Hosts
    /// use this to drain output queues.
    pub fn handles(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.conns.keys()
    }

    // =========================================================================
    // Connection setup
    // =========================================================================

    /// Start an active open from `local` toward `peer`. Reports
    /// `InProgress` when the handshake has been started; completion is
    /// polled via [`ConnTable::connect_error`].
    pub fn connect<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<(), ConnectError> {
        let Some(conn) = self.conns.get_mut(id) else {
            return Err(ConnectError::Invalid);
        };
        conn.connect(deps, id, local, peer)
    }

    /// The result a non-blocking connect would report right now, in the
    /// manner of `getsockopt(SO_ERROR)`. `None` means connected and
    /// healthy.
    pub fn connect_error(&self, id: ConnId) -> Option<ConnectError> {
        match self.conns.get(id) {
            None => Some(ConnectError::Invalid),
            Some(conn) => conn.connect_error(),
        }
    }

    /// Put a fresh connection into the listening state.
    pub fn listen(
        &mut self,
        id: ConnId,
        local: SocketAddrV4,
        backlog: usize,
    ) -> Result<(), TcpError> {
        let conn = self.conns.get_mut(id).ok_or(TcpError::NotFound)?;
        if conn.state != TcpState::Closed
            || conn.server.is_some()
            || conn.flags.contains(ConnFlags::LOCAL_CLOSED)
        {
            return Err(TcpError::InvalidState);
        }
        conn.local = Some(local);
        conn.server = Some(ServerState::new(backlog));
        conn.state = TcpState::Listen;
        debug!("tcp: CLOSED -> LISTEN id={id:?} local={local}");
        Ok(())
    }

    /// Pop the next established child off a listener's accept queue,
    /// returning its handle and the peer it serves.
    ///
    /// A child reset before acceptance is reported as `Aborted` (one
    /// call, one queue entry); a child released before acceptance is
    /// skipped silently.
    pub fn accept(&mut self, id: ConnId) -> Result<(ConnId, SocketAddrV4), AcceptError> {
        loop {
            let conn = self.conns.get_mut(id).ok_or(AcceptError::NotFound)?;
            let Some(server) = conn.server.as_mut() else {
                return Err(AcceptError::Invalid);
            };
            let Some(child_id) = server.pop_pending() else {
                self.update_listener_readable(id);
                return Err(AcceptError::WouldBlock);
            };
            let Some(child) = self.conns.get_mut(child_id) else {
                continue;
            };
            if child.flags.contains(ConnFlags::RESET_SIGNALED) {
                self.update_listener_readable(id);
                return Err(AcceptError::Aborted);
            }
            let Some(peer) = child.peer else {
                continue;
            };
            if let Some(state) = child.child.as_mut() {
                state.phase = ChildPhase::Accepted;
            }
            child.status.insert(SocketStatus::ACTIVE | SocketStatus::WRITABLE);
            self.update_listener_readable(id);
            debug!("tcp: accepted id={child_id:?} peer={peer} from listener id={id:?}");
            return Ok((child_id, peer));
        }
    }

    // =========================================================================
    // Packet path
    // =========================================================================

    /// Deliver one inbound packet. Listener traffic is redirected to the
    /// child owning the source address; an unmatched SYN spawns a new
    /// child. Returns true when the packet could not be absorbed and the
    /// sender must treat it as dropped.
    pub fn process_packet<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        packet: &Packet,
    ) -> bool {
        let header = *packet.header();
        let target = {
            let Some(conn) = self.conns.get(id) else {
                return false;
            };
            match &conn.server {
                None => id,
                Some(server) => {
                    if let Some(child_id) = server.child_for(header.src) {
                        child_id
                    } else if header.is_syn() && !header.is_ack() {
                        if server.at_capacity() {
                            // Backlog full: drop the SYN without an
                            // answer, as if it never arrived.
                            debug!(
                                "tcp: backlog full, dropping SYN from {} id={id:?}",
                                header.src
                            );
                            return false;
                        }
                        return self.spawn_child(deps, id, &header);
                    } else {
                        id
                    }
                }
            }
        };

        let mut reactions = Reactions::default();
        let dropped = match self.conns.get_mut(target) {
            Some(conn) => conn.process_input(deps, target, packet, &mut reactions),
            None => false,
        };
        self.apply(deps, target, reactions);
        dropped
    }

    /// Spawn a child connection answering `syn`, bound to the address the
    /// SYN was sent to.
    fn spawn_child<D: Dependencies>(
        &mut self,
        deps: &mut D,
        parent: ConnId,
        syn: &TcpHeader,
    ) -> bool {
        let child_id = self.conns.insert(Connection::new(self.config));
        if let Some(listener) = self.conns.get_mut(parent)
            && let Some(server) = listener.server.as_mut()
        {
            server.register_child(syn.src, child_id);
        }
        debug!(
            "tcp: listener id={parent:?} spawned id={child_id:?} for {}",
            syn.src
        );
        if let Some(child) = self.conns.get_mut(child_id) {
            child.accept_syn(deps, child_id, parent, syn.dst, syn.src, syn);
        }
        false
    }

    /// The wire reported one of our packets dropped. Reports against a
    /// listener are routed to the child that sent the packet.
    pub fn on_packet_dropped<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        packet: &Packet,
    ) {
        let target = {
            let Some(conn) = self.conns.get(id) else {
                return;
            };
            match &conn.server {
                Some(server) => match server.child_for(packet.header().dst) {
                    Some(child_id) => child_id,
                    // A listener's own packets are unledgered controls.
                    None => return,
                },
                None => id,
            }
        };
        if let Some(conn) = self.conns.get_mut(target) {
            conn.on_packet_dropped(deps, target, packet);
        }
    }

    /// Pop the next wire-ready packet from a connection's output queue.
    pub fn pop_packet<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) -> Option<Packet> {
        let conn = self.conns.get_mut(id)?;
        let packet = conn.output.pop()?;
        // The pop freed output space; staged packets may move up.
        conn.flush(deps, id);
        Some(packet)
    }

    // =========================================================================
    // User data path
    // =========================================================================

    pub fn send_user_data<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        buf: &[u8],
    ) -> Result<usize, SendError> {
        let conn = self.conns.get_mut(id).ok_or(SendError::NotFound)?;
        conn.send_user_data(deps, id, buf)
    }

    pub fn receive_user_data<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
        buf: &mut [u8],
    ) -> Result<usize, RecvError> {
        let conn = self.conns.get_mut(id).ok_or(RecvError::NotFound)?;
        conn.receive_user_data(deps, id, buf)
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Close the sending direction of a connection, or begin tearing down
    /// a listener and everything it spawned.
    pub fn close<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) -> Result<(), TcpError> {
        let Some(conn) = self.conns.get_mut(id) else {
            return Err(TcpError::NotFound);
        };
        if conn.server.is_some() {
            return self.close_listener(deps, id);
        }
        let mut reactions = Reactions::default();
        conn.close(deps, id, &mut reactions);
        self.apply(deps, id, reactions);
        Ok(())
    }

    /// Listener close: close every child, then close the listener itself
    /// once the last child is gone.
    fn close_listener<D: Dependencies>(
        &mut self,
        deps: &mut D,
        id: ConnId,
    ) -> Result<(), TcpError> {
        let child_ids = {
            let conn = self.conns.get_mut(id).ok_or(TcpError::NotFound)?;
            conn.flags.insert(ConnFlags::LOCAL_CLOSED);
            match conn.server.as_ref() {
                Some(server) => server.child_ids(),
                None => return Err(TcpError::InvalidState),
            }
        };
        if child_ids.is_empty() {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.state = TcpState::Closed;
                conn.status = SocketStatus::CLOSED;
            }
            debug!("tcp: LISTEN -> CLOSED id={id:?}");
            deps.on_connection_closed(id);
            return Ok(());
        }
        if let Some(conn) = self.conns.get_mut(id) {
            conn.flags.insert(ConnFlags::CLOSE_PENDING);
        }
        debug!(
            "tcp: listener id={id:?} closing, {} children remain",
            child_ids.len()
        );
        for child_id in child_ids {
            let mut reactions = Reactions::default();
            if let Some(child) = self.conns.get_mut(child_id) {
                child.close(deps, child_id, &mut reactions);
            }
            self.apply(deps, child_id, reactions);
        }
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// A close timer scheduled through [`Dependencies`] fired. Ignored
    /// unless the connection is still in TimeWait.
    pub fn on_close_timer_expired<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) {
        let mut reactions = Reactions::default();
        if let Some(conn) = self.conns.get_mut(id) {
            conn.on_close_timer_expired(deps, id, &mut reactions);
        }
        self.apply(deps, id, reactions);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn state(&self, id: ConnId) -> Result<TcpState, TcpError> {
        self.conns.get(id).map(|c| c.state).ok_or(TcpError::NotFound)
    }

    pub fn status(&self, id: ConnId) -> Result<SocketStatus, TcpError> {
        self.conns.get(id).map(|c| c.status).ok_or(TcpError::NotFound)
    }

    pub fn info(&self, id: ConnId) -> Result<TcpInfo, TcpError> {
        self.conns.get(id).map(|c| c.info()).ok_or(TcpError::NotFound)
    }

    pub fn local_addr(&self, id: ConnId) -> Option<SocketAddrV4> {
        self.conns.get(id).and_then(|c| c.local)
    }

    pub fn peer_addr(&self, id: ConnId) -> Option<SocketAddrV4> {
        self.conns.get(id).and_then(|c| c.peer)
    }

    // =========================================================================
    // Cross-connection reactions
    // =========================================================================

    fn apply<D: Dependencies>(&mut self, deps: &mut D, id: ConnId, reactions: Reactions) {
        if reactions.child_established {
            self.promote(id);
        }
        if reactions.closed {
            self.finish_close(deps, id);
        }
    }

    /// Offer an established child to its listener's accept queue. If the
    /// queue is full the child stays incomplete and is re-offered on its
    /// next packet.
    fn promote(&mut self, child_id: ConnId) {
        let Some(child) = self.conns.get(child_id) else {
            return;
        };
        let Some(state) = child.child else {
            return;
        };
        if state.phase != ChildPhase::Incomplete {
            return;
        }
        let Some(parent) = self.conns.get_mut(state.parent) else {
            return;
        };
        let Some(server) = parent.server.as_mut() else {
            return;
        };
        if !server.push_pending(child_id) {
            return;
        }
        parent.status.insert(SocketStatus::READABLE);
        if let Some(child) = self.conns.get_mut(child_id)
            && let Some(state) = child.child.as_mut()
        {
            state.phase = ChildPhase::Pending;
        }
    }

    /// A connection reached Closed: tell the host, and detach it from a
    /// listening parent, possibly completing the parent's own close.
    fn finish_close<D: Dependencies>(&mut self, deps: &mut D, id: ConnId) {
        deps.on_connection_closed(id);
        let parent_info = self
            .conns
            .get(id)
            .and_then(|conn| conn.child.map(|c| c.parent).zip(conn.peer));
        let Some((parent_id, peer)) = parent_info else {
            return;
        };
        let mut parent_done = false;
        if let Some(parent) = self.conns.get_mut(parent_id)
            && let Some(server) = parent.server.as_mut()
        {
            server.forget_child(peer);
            parent_done =
                parent.flags.contains(ConnFlags::CLOSE_PENDING) && !server.has_children();
        }
        if parent_done {
            if let Some(parent) = self.conns.get_mut(parent_id) {
                parent.state = TcpState::Closed;
                parent.status = SocketStatus::CLOSED;
            }
            debug!("tcp: LISTEN -> CLOSED id={parent_id:?} (last child gone)");
            deps.on_connection_closed(parent_id);
        }
    }

    fn update_listener_readable(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.get_mut(id)
            && let Some(server) = &conn.server
        {
            let readable = server.has_pending();
            conn.status.set(SocketStatus::READABLE, readable);
        }
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
