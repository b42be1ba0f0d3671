//! Listener bookkeeping: the child connection map, the accept queue, and
//! the remembered source of the last inbound packet (used to address
//! control replies such as a RST to a stray segment).

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddrV4;

use crate::tcp::{BACKLOG_MAX, BACKLOG_MIN, ConnId};

/// Where a spawned child connection stands relative to its listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChildPhase {
    /// Handshake incomplete, or complete but the accept queue was full.
    Incomplete,
    /// Queued on the listener, waiting for an `accept` call.
    Pending,
    /// Handed to the application.
    Accepted,
}

/// Per-child state stored on the child connection itself.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChildState {
    pub parent: ConnId,
    pub phase: ChildPhase,
}

impl ChildState {
    pub fn new(parent: ConnId) -> Self {
        Self { parent, phase: ChildPhase::Incomplete }
    }
}

/// State carried only by listening connections.
#[derive(Debug)]
pub(crate) struct ServerState {
    /// Children keyed by peer address. BTreeMap so teardown sweeps run in
    /// a deterministic order.
    children: BTreeMap<SocketAddrV4, ConnId>,
    /// Fully established children awaiting `accept`.
    pending: VecDeque<ConnId>,
    /// Cap on both the pending queue and the child map.
    backlog: usize,
    /// Source address of the last packet delivered to this listener.
    last_peer: Option<SocketAddrV4>,
    /// Destination address of the last packet delivered to this listener.
    last_local: Option<SocketAddrV4>,
}

impl ServerState {
    pub fn new(backlog: usize) -> Self {
        Self {
            children: BTreeMap::new(),
            pending: VecDeque::new(),
            backlog: backlog.clamp(BACKLOG_MIN, BACKLOG_MAX),
            last_peer: None,
            last_local: None,
        }
    }

    /// Remember the addressing of an inbound packet so a later control
    /// reply (e.g. a RST) can be addressed without a packet in hand.
    pub fn remember(&mut self, peer: SocketAddrV4, local: SocketAddrV4) {
        self.last_peer = Some(peer);
        self.last_local = Some(local);
    }

    #[inline]
    pub fn last_peer(&self) -> Option<SocketAddrV4> {
        self.last_peer
    }

    #[inline]
    pub fn last_local(&self) -> Option<SocketAddrV4> {
        self.last_local
    }

    /// Child handling this peer, if one was already spawned.
    #[inline]
    pub fn child_for(&self, peer: SocketAddrV4) -> Option<ConnId> {
        self.children.get(&peer).copied()
    }

    /// True when a fresh SYN must be dropped instead of spawning.
    #[inline]
    pub fn at_capacity(&self) -> bool {
        self.children.len() >= self.backlog
    }

    pub fn register_child(&mut self, peer: SocketAddrV4, child: ConnId) {
        self.children.insert(peer, child);
    }

    /// Drop a child from the map once it has fully closed.
    pub fn forget_child(&mut self, peer: SocketAddrV4) {
        self.children.remove(&peer);
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Snapshot of all child ids, for teardown sweeps that mutate the map.
    pub fn child_ids(&self) -> Vec<ConnId> {
        self.children.values().copied().collect()
    }

    /// Queue an established child for `accept`. Fails when the backlog is
    /// full; the child then stays incomplete and is re-offered later.
    pub fn push_pending(&mut self, child: ConnId) -> bool {
        if self.pending.len() >= self.backlog {
            return false;
        }
        self.pending.push_back(child);
        true
    }

    pub fn pop_pending(&mut self) -> Option<ConnId> {
        self.pending.pop_front()
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
