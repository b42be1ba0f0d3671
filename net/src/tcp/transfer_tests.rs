//! Data-path tests: ordered delivery, flow control against a slow
//! reader, duplicate tolerance, and loss recovery.

use wraith_lib::time::SimDuration;

use crate::packet::Packet;
use crate::status::SocketStatus;
use crate::tcp::{RecvError, TcpConfig};
use crate::testkit::Sim;

fn patterned(len: usize, modulus: usize) -> Vec<u8> {
    (0..len).map(|i| (i % modulus) as u8).collect()
}

// ============================================================================
// 1. Ordered delivery
// ============================================================================

#[test]
fn small_payload_round_trip() {
    let mut sim = Sim::new();
    let child = sim.establish();

    let message = b"hello, simulated world";
    let sent = sim
        .client
        .send_user_data(&mut sim.client_host, sim.client_conn, message)
        .expect("send");
    assert_eq!(sent, message.len());
    sim.pump_until_quiet();

    assert!(
        sim.server
            .status(child)
            .unwrap()
            .contains(SocketStatus::READABLE)
    );
    let mut buf = [0u8; 64];
    let n = sim
        .server
        .receive_user_data(&mut sim.server_host, child, &mut buf)
        .expect("recv");
    assert_eq!(&buf[..n], message);
    assert_eq!(
        sim.server
            .receive_user_data(&mut sim.server_host, child, &mut buf),
        Err(RecvError::WouldBlock)
    );
    assert!(
        !sim.server
            .status(child)
            .unwrap()
            .contains(SocketStatus::READABLE)
    );
}

#[test]
fn bulk_transfer_with_partial_reads() {
    let payload = patterned(100_000, 251);
    let mut sim = Sim::new();
    let child = sim.establish();

    let sent = sim
        .client
        .send_user_data(&mut sim.client_host, sim.client_conn, &payload)
        .expect("send");
    assert_eq!(sent, payload.len());
    sim.pump_until_quiet();

    // Drain with a read buffer smaller than one packet so every read
    // leaves a partially consumed packet behind.
    let mut received = Vec::with_capacity(payload.len());
    let mut chunk = [0u8; 1000];
    loop {
        match sim
            .server
            .receive_user_data(&mut sim.server_host, child, &mut chunk)
        {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(RecvError::WouldBlock) => break,
            Err(other) => panic!("unexpected recv error: {other:?}"),
        }
    }
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

// ============================================================================
// 2. Flow control
// ============================================================================

#[test]
fn zero_window_stalls_sender_until_a_read() {
    let config = TcpConfig {
        recv_buffer: 3 * 1460,
        ..TcpConfig::default()
    };
    let mut sim = Sim::with_config(config);
    let child = sim.establish();

    let payload = patterned(10 * 1460, 127);
    assert_eq!(
        sim.client
            .send_user_data(&mut sim.client_host, sim.client_conn, &payload),
        Ok(payload.len())
    );
    sim.pump_until_quiet();

    // Three packets filled the receive buffer; the advertised window hit
    // zero and the sender is parked.
    assert!(
        sim.client
            .pop_packet(&mut sim.client_host, sim.client_conn)
            .is_none()
    );

    // One read reopens the window; the advertisement goes out as a bare
    // ACK because no inbound packet will carry it.
    let mut chunk = [0u8; 1460];
    let n = sim
        .server
        .receive_user_data(&mut sim.server_host, child, &mut chunk)
        .expect("first read");
    assert_eq!(n, 1460);
    let update = sim
        .server
        .pop_packet(&mut sim.server_host, child)
        .expect("window update");
    assert!(update.header().is_ack());
    assert_eq!(update.seq(), 0);
    assert_eq!(update.header().ack, 4);
    assert_eq!(update.header().window, 1);
    sim.deliver_to_client(child, &update);

    let resumed = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("sender resumed");
    assert_eq!(resumed.seq(), 4);
    sim.deliver_to_server(sim.client_conn, &resumed);

    // Alternate reads and pumps until the rest trickles through.
    let mut received = Vec::with_capacity(payload.len());
    received.extend_from_slice(&chunk[..n]);
    for _ in 0..100 {
        loop {
            match sim
                .server
                .receive_user_data(&mut sim.server_host, child, &mut chunk)
            {
                Ok(got) => received.extend_from_slice(&chunk[..got]),
                Err(RecvError::WouldBlock) => break,
                Err(other) => panic!("unexpected recv error: {other:?}"),
            }
        }
        if sim.pump_once() == 0 && received.len() == payload.len() {
            break;
        }
    }
    assert_eq!(received, payload);
}

#[test]
fn data_past_the_window_is_refused() {
    let config = TcpConfig {
        recv_buffer: 3 * 1460,
        ..TcpConfig::default()
    };
    let mut sim = Sim::with_config(config);
    let _child = sim.establish();

    let chunk = vec![7u8; 1460];
    for seq in 1..=3u32 {
        let packet = Packet::data(sim.client_addr(), sim.server_addr(), seq, &chunk);
        assert!(
            !sim.server
                .process_packet(&mut sim.server_host, sim.listener, &packet)
        );
    }
    // The buffer is full and the window closed; one more packet must be
    // reported back as dropped.
    let beyond = Packet::data(sim.client_addr(), sim.server_addr(), 4, &chunk);
    assert!(
        sim.server
            .process_packet(&mut sim.server_host, sim.listener, &beyond)
    );
}

#[test]
fn next_expected_packet_bypasses_a_full_buffer() {
    let config = TcpConfig {
        recv_buffer: 3 * 1460,
        ..TcpConfig::default()
    };
    let mut sim = Sim::with_config(config);
    let _child = sim.establish();

    // Larger than the whole receive buffer.
    let jumbo = vec![9u8; 5000];
    let first = Packet::data(sim.client_addr(), sim.server_addr(), 1, &jumbo);
    // The next expected packet is always admitted so the stream can make
    // progress.
    assert!(
        !sim.server
            .process_packet(&mut sim.server_host, sim.listener, &first)
    );
    // Anything else oversized is refused while the buffer cannot take
    // it.
    let second = Packet::data(sim.client_addr(), sim.server_addr(), 2, &jumbo);
    assert!(
        sim.server
            .process_packet(&mut sim.server_host, sim.listener, &second)
    );
}

// ============================================================================
// 3. Duplicates
// ============================================================================

#[test]
fn duplicate_data_and_acks_are_idempotent() {
    let mut sim = Sim::new();
    let child = sim.establish();

    for chunk in [b"aaa", b"bbb", b"ccc"] {
        sim.client
            .send_user_data(&mut sim.client_host, sim.client_conn, chunk)
            .expect("send");
    }
    let p1 = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("p1");
    let p2 = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("p2");
    let p3 = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("p3");
    assert_eq!((p1.seq(), p2.seq(), p3.seq()), (1, 2, 3));

    // Deliver out of order, duplicating the middle packet both while it
    // waits in the reorder queue and after it has been delivered.
    sim.deliver_to_server(sim.client_conn, &p2);
    sim.deliver_to_server(sim.client_conn, &p2);
    sim.deliver_to_server(sim.client_conn, &p1);
    sim.deliver_to_server(sim.client_conn, &p3);
    sim.deliver_to_server(sim.client_conn, &p1);

    let mut buf = [0u8; 16];
    let n = sim
        .server
        .receive_user_data(&mut sim.server_host, child, &mut buf)
        .expect("recv");
    assert_eq!(&buf[..n], b"aaabbbccc");

    // Replayed ACKs are benign: no resets, no spurious output.
    let mut acks = Vec::new();
    while let Some(ack) = sim.server.pop_packet(&mut sim.server_host, child) {
        assert!(!ack.header().is_rst());
        acks.push(ack);
    }
    for ack in &acks {
        sim.deliver_to_client(child, ack);
        sim.deliver_to_client(child, ack);
    }
    assert!(
        sim.client
            .pop_packet(&mut sim.client_host, sim.client_conn)
            .is_none()
    );
}

// ============================================================================
// 4. Loss recovery
// ============================================================================

#[test]
fn lost_packet_is_retransmitted_first() {
    let payload = patterned(14_600, 253);
    let mut sim = Sim::new();
    let child = sim.establish();

    for chunk in payload.chunks(1460) {
        assert_eq!(
            sim.client
                .send_user_data(&mut sim.client_host, sim.client_conn, chunk),
            Ok(1460)
        );
    }

    // All ten fit the initial congestion window.
    let mut wire = Vec::new();
    while let Some(packet) = sim.client.pop_packet(&mut sim.client_host, sim.client_conn) {
        wire.push(packet);
    }
    assert_eq!(wire.len(), 10);

    // The fifth packet dies on the wire.
    for (i, packet) in wire.iter().enumerate() {
        if i == 4 {
            sim.client
                .on_packet_dropped(&mut sim.client_host, sim.client_conn, packet);
        } else {
            sim.deliver_to_server(sim.client_conn, packet);
        }
    }

    // The retransmission leads the queue, ahead of nothing else pending.
    let retx = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("retransmission");
    assert_eq!(retx.seq(), 5);
    assert_eq!(
        sim.client.info(sim.client_conn).unwrap().retransmit_count,
        1
    );
    sim.deliver_to_server(sim.client_conn, &retx);
    sim.pump_until_quiet();

    let mut received = Vec::with_capacity(payload.len());
    let mut chunk = [0u8; 2048];
    loop {
        match sim
            .server
            .receive_user_data(&mut sim.server_host, child, &mut chunk)
        {
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(RecvError::WouldBlock) => break,
            Err(other) => panic!("unexpected recv error: {other:?}"),
        }
    }
    assert_eq!(received, payload);
}

// ============================================================================
// 5. Telemetry
// ============================================================================

#[test]
fn round_trip_time_follows_the_clock() {
    let mut sim = Sim::new();
    let child = sim.establish();

    sim.client
        .send_user_data(&mut sim.client_host, sim.client_conn, b"ping")
        .expect("send");
    let data = sim
        .client
        .pop_packet(&mut sim.client_host, sim.client_conn)
        .expect("data");
    sim.client_host.advance(SimDuration::from_millis(10));
    sim.deliver_to_server(sim.client_conn, &data);
    let ack = sim
        .server
        .pop_packet(&mut sim.server_host, child)
        .expect("ack");
    sim.deliver_to_client(child, &ack);

    let info = sim.client.info(sim.client_conn).unwrap();
    assert_eq!(info.rtt, Some(SimDuration::from_millis(10)));
    assert!(info.last_data_sent.is_some());
    assert!(info.last_ack_received.is_some());
    let child_info = sim.server.info(child).unwrap();
    assert!(child_info.last_data_received.is_some());
    assert!(child_info.last_ack_sent.is_some());
}
