//! Test scaffolding: a scripted [`Dependencies`] implementation and a
//! two-host harness that shuttles packets between a client table and a
//! server table, reporting refused packets back as drops.

use std::net::{Ipv4Addr, SocketAddrV4};

use wraith_lib::time::{SimDuration, SimTime};

use crate::deps::{BufferSizes, Dependencies};
use crate::packet::Packet;
use crate::tcp::table::ConnTable;
use crate::tcp::{ConnId, ConnectError, TcpState};

/// Address on the 10.0.0.0/24 test net.
pub(crate) fn sa(host: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, host), port)
}

// =============================================================================
// TestHost
// =============================================================================

/// A host's view of the world: a clock it controls and a log of every
/// callback the engine raised.
#[derive(Default)]
pub(crate) struct TestHost {
    pub now: SimTime,
    /// Scheduled close timers as (due time, connection).
    pub timers: Vec<(SimTime, ConnId)>,
    /// Connections reported fully closed, in order.
    pub closed: Vec<ConnId>,
    /// Buffer sizes to hand out at establishment, if any.
    pub sizes: Option<BufferSizes>,
    /// Receive-buffer occupancy samples as (connection, used, capacity).
    pub occupancy: Vec<(ConnId, usize, usize)>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, delta: SimDuration) {
        self.now = self.now + delta;
    }
}

impl Dependencies for TestHost {
    fn now(&self) -> SimTime {
        self.now
    }

    fn schedule_close_timer(&mut self, conn: ConnId, delay: SimDuration) {
        self.timers.push((self.now + delay, conn));
    }

    fn autotuned_buffer_sizes(&mut self, _conn: ConnId) -> Option<BufferSizes> {
        self.sizes
    }

    fn record_buffer_occupancy(&mut self, conn: ConnId, used: usize, capacity: usize) {
        self.occupancy.push((conn, used, capacity));
    }

    fn on_connection_closed(&mut self, conn: ConnId) {
        self.closed.push(conn);
    }
}

/// Fire every timer due at or before the host's current time.
pub(crate) fn fire_due_timers(host: &mut TestHost, table: &mut ConnTable) {
    let now = host.now;
    let mut due = Vec::new();
    host.timers.retain(|&(at, id)| {
        if at <= now {
            due.push(id);
            false
        } else {
            true
        }
    });
    for id in due {
        table.on_close_timer_expired(host, id);
    }
}

// =============================================================================
// Two-host simulation
// =============================================================================

/// A client and a server host wired back to back with a lossless,
/// zero-latency link. Tests that need loss or delay pop and deliver
/// packets by hand instead of using [`Sim::pump_once`].
pub(crate) struct Sim {
    pub client: ConnTable,
    pub server: ConnTable,
    pub client_host: TestHost,
    pub server_host: TestHost,
    pub client_conn: ConnId,
    pub listener: ConnId,
}

pub(crate) const CLIENT_ADDR: (u8, u16) = (1, 2000);
pub(crate) const SERVER_ADDR: (u8, u16) = (2, 80);

impl Sim {
    pub fn new() -> Self {
        Self::with_config(crate::tcp::TcpConfig::default())
    }

    pub fn with_config(config: crate::tcp::TcpConfig) -> Self {
        let mut client = ConnTable::with_config(config);
        let mut server = ConnTable::with_config(config);
        let client_conn = client.open();
        let listener = server.open();
        Self {
            client,
            server,
            client_host: TestHost::new(),
            server_host: TestHost::new(),
            client_conn,
            listener,
        }
    }

    pub fn client_addr(&self) -> SocketAddrV4 {
        sa(CLIENT_ADDR.0, CLIENT_ADDR.1)
    }

    pub fn server_addr(&self) -> SocketAddrV4 {
        sa(SERVER_ADDR.0, SERVER_ADDR.1)
    }

    /// Deliver one packet into the server host, reporting a refusal back
    /// to the sending client connection as a drop.
    pub fn deliver_to_server(&mut self, from: ConnId, packet: &Packet) {
        let refused = self
            .server
            .process_packet(&mut self.server_host, self.listener, packet);
        if refused {
            self.client
                .on_packet_dropped(&mut self.client_host, from, packet);
        }
    }

    /// Deliver one packet into the client host, routed by destination
    /// address.
    pub fn deliver_to_client(&mut self, from: ConnId, packet: &Packet) {
        let target = self.client_route(packet.header().dst);
        let refused = self
            .client
            .process_packet(&mut self.client_host, target, packet);
        if refused {
            self.server
                .on_packet_dropped(&mut self.server_host, from, packet);
        }
    }

    fn client_route(&self, dst: SocketAddrV4) -> ConnId {
        self.client
            .handles()
            .find(|&id| self.client.local_addr(id) == Some(dst))
            .unwrap_or(self.client_conn)
    }

    /// Move every wire-ready packet once in each direction. Returns the
    /// number of packets delivered.
    pub fn pump_once(&mut self) -> usize {
        let mut moved = 0;
        let client_ids: Vec<ConnId> = self.client.handles().collect();
        for id in client_ids {
            while let Some(packet) = self.client.pop_packet(&mut self.client_host, id) {
                moved += 1;
                self.deliver_to_server(id, &packet);
            }
        }
        let server_ids: Vec<ConnId> = self.server.handles().collect();
        for id in server_ids {
            while let Some(packet) = self.server.pop_packet(&mut self.server_host, id) {
                moved += 1;
                self.deliver_to_client(id, &packet);
            }
        }
        moved
    }

    /// Pump until no packets are in flight in either direction.
    pub fn pump_until_quiet(&mut self) {
        for _ in 0..100 {
            if self.pump_once() == 0 {
                return;
            }
        }
        panic!("simulation did not quiesce");
    }

    /// Full setup: listener listening, client connected, child accepted.
    /// Returns the accepted child's handle.
    pub fn establish(&mut self) -> ConnId {
        self.server
            .listen(self.listener, self.server_addr(), 8)
            .expect("listen");
        let client_addr = self.client_addr();
        let server_addr = self.server_addr();
        let started = self.client.connect(
            &mut self.client_host,
            self.client_conn,
            client_addr,
            server_addr,
        );
        assert_eq!(started, Err(ConnectError::InProgress));
        self.pump_until_quiet();
        let (child, peer) = self.server.accept(self.listener).expect("accept");
        assert_eq!(peer, self.client_addr());
        assert_eq!(
            self.client.state(self.client_conn).expect("client state"),
            TcpState::Established
        );
        assert_eq!(
            self.server.state(child).expect("child state"),
            TcpState::Established
        );
        child
    }
}
