//! Relay behavior tests over the in-memory network.
//!
//! Each test drives the relay one iteration at a time against
//! `murmur-harness` sockets, so ordering within an iteration is observable.

use std::{io::ErrorKind, time::Duration};

use murmur_harness::{SimMultiplexer, SimNetwork, WriteBehavior};
use murmur_server::{
    ConnectionId, Relay, RelayConfig, ServerError,
    broadcast::{CAPACITY_NOTICE, join_notice, leave_notice},
};

const JOIN: &str = "new client connecting from 127.0.0.1\n";

fn relay_with(net: &SimNetwork, config: RelayConfig) -> Relay<SimMultiplexer> {
    Relay::new(net.listener(), net.multiplexer(), config).unwrap()
}

fn relay(net: &SimNetwork, max_connections: usize) -> Relay<SimMultiplexer> {
    relay_with(net, RelayConfig { max_connections, ..RelayConfig::default() })
}

/// Iterate until no slot carries readiness.
fn settle(relay: &mut Relay<SimMultiplexer>) {
    for _ in 0..64 {
        relay.poll_once(None).unwrap();
        if !relay.registry().has_pending() {
            return;
        }
    }
    panic!("relay did not settle");
}

#[test]
fn join_announcements_reach_earlier_clients_only() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);

    let a = net.connect();
    settle(&mut relay);
    let b = net.connect();
    settle(&mut relay);
    let c = net.connect();
    settle(&mut relay);

    assert_eq!(relay.registry().count(), 4);
    assert_eq!(a.take_text(), JOIN.repeat(2));
    assert_eq!(b.take_text(), JOIN);
    assert_eq!(c.take_text(), "");
}

#[test]
fn unresolvable_peer_is_announced_as_unknown() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);

    let a = net.connect();
    settle(&mut relay);
    let _anonymous = net.connect_anonymous();
    settle(&mut relay);

    assert_eq!(a.take_text(), join_notice("unknown"));
    assert_eq!(relay.registry().info(ConnectionId(2)).unwrap().addr, "unknown");
}

#[test]
fn chunk_is_relayed_to_everyone_but_sender() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let peers: Vec<_> = (0..3).map(|_| net.connect()).collect();
    settle(&mut relay);
    for peer in &peers {
        peer.take_received();
    }

    peers[0].send(b"hi");
    settle(&mut relay);

    assert_eq!(peers[0].take_text(), "");
    assert_eq!(peers[1].take_text(), "1: hi");
    assert_eq!(peers[2].take_text(), "1: hi");
}

#[test]
fn orderly_shutdown_announces_leave_and_frees_slot() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 3);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    b.take_received();

    a.hang_up();
    settle(&mut relay);

    assert!(a.is_closed());
    assert_eq!(b.take_text(), leave_notice(ConnectionId(1)));
    assert_eq!(relay.registry().count(), 2);
    assert_eq!(relay.registry().slot_of(ConnectionId(2)), Some(1));
    assert_eq!(net.watched(), 1);

    let _c = net.connect();
    settle(&mut relay);
    assert_eq!(relay.registry().slot_of(ConnectionId(3)), Some(2));
}

#[test]
fn leave_announcement_reaches_every_remaining_client() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let peers: Vec<_> = (0..3).map(|_| net.connect()).collect();
    settle(&mut relay);
    for peer in &peers {
        peer.take_received();
    }

    peers[2].hang_up();
    settle(&mut relay);

    let notice = leave_notice(ConnectionId(3));
    assert_eq!(peers[0].take_text(), notice);
    assert_eq!(peers[1].take_text(), notice);
}

#[test]
fn receive_error_disconnects_without_announcement() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    a.take_received();

    b.fail_reads(ErrorKind::ConnectionReset);
    settle(&mut relay);

    assert!(b.is_closed());
    assert!(!relay.registry().contains(ConnectionId(2)));
    assert_eq!(a.take_text(), "");
}

#[test]
fn hangup_only_readiness_still_announces_leave() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    a.take_received();

    b.hang_up_silently();
    settle(&mut relay);

    assert!(b.is_closed());
    assert!(!relay.registry().contains(ConnectionId(2)));
    assert_eq!(a.take_text(), leave_notice(ConnectionId(2)));
    assert_eq!(net.watched(), 1);
}

#[test]
fn error_only_readiness_still_disconnects() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    a.take_received();

    b.fail_reads_silently(ErrorKind::ConnectionReset);
    settle(&mut relay);

    assert!(b.is_closed());
    assert!(!relay.registry().contains(ConnectionId(2)));
    assert_eq!(a.take_text(), "");
}

#[test]
fn connection_beyond_capacity_gets_notice_and_is_dropped() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 3);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    a.take_received();

    let late = net.connect();
    settle(&mut relay);

    assert_eq!(late.received(), CAPACITY_NOTICE);
    assert!(late.is_closed());
    assert_eq!(relay.registry().count(), 3);
    assert!(!relay.registry().members().any(|id| id == ConnectionId(3)));
    assert_eq!(a.take_text(), "");
    assert_eq!(b.take_text(), "");
}

#[test]
fn capacity_notice_is_best_effort() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 2);
    let _a = net.connect();
    settle(&mut relay);

    let late = net.connect();
    late.set_write_behavior(WriteBehavior::Stall);
    settle(&mut relay);

    assert!(late.received().is_empty());
    assert!(late.is_closed());
}

#[test]
fn trickling_receiver_gets_whole_message() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    b.take_received();
    b.set_write_behavior(WriteBehavior::Trickle { step: 1 });

    a.send(b"hello world\n");
    settle(&mut relay);

    assert_eq!(b.take_text(), "1: hello world\n");
}

#[test]
fn stalled_receiver_does_not_block_others() {
    let net = SimNetwork::new();
    let config = RelayConfig {
        max_connections: 6,
        send_retry_limit: 8,
        send_stall_timeout: Duration::ZERO,
        ..RelayConfig::default()
    };
    let mut relay = relay_with(&net, config);
    let a = net.connect();
    let b = net.connect();
    let c = net.connect();
    settle(&mut relay);
    c.take_received();
    b.set_write_behavior(WriteBehavior::Stall);

    a.send(b"ping");
    settle(&mut relay);

    assert_eq!(c.take_text(), "1: ping");
    assert!(relay.registry().contains(ConnectionId(2)));
}

#[test]
fn failing_receiver_is_skipped_but_kept() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    let c = net.connect();
    settle(&mut relay);
    c.take_received();
    b.set_write_behavior(WriteBehavior::Fail(ErrorKind::BrokenPipe));

    a.send(b"ping");
    settle(&mut relay);

    assert_eq!(c.take_text(), "1: ping");
    assert!(!b.is_closed());
    assert!(relay.registry().contains(ConnectionId(2)));
}

#[test]
fn long_message_is_relayed_as_separate_chunks() {
    let net = SimNetwork::new();
    let config =
        RelayConfig { max_connections: 6, recv_chunk_size: 4, ..RelayConfig::default() };
    let mut relay = relay_with(&net, config);
    let a = net.connect();
    let b = net.connect();
    settle(&mut relay);
    b.take_received();

    a.send(b"abcdefgh");
    settle(&mut relay);

    assert_eq!(b.take_text(), "1: abcd1: efgh");
}

#[test]
fn one_chunk_per_connection_per_iteration_in_slot_order() {
    let net = SimNetwork::new();
    let config =
        RelayConfig { max_connections: 6, recv_chunk_size: 4, ..RelayConfig::default() };
    let mut relay = relay_with(&net, config);
    let a = net.connect();
    let b = net.connect();
    let c = net.connect();
    settle(&mut relay);
    c.take_received();

    a.send(b"aaaaAAAA");
    b.send(b"bbbb");
    settle(&mut relay);

    assert_eq!(c.take_text(), "1: aaaa2: bbbb1: AAAA");
}

#[test]
fn slot_refilled_by_removal_is_serviced_in_same_iteration() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let b = net.connect();
    let c = net.connect();
    settle(&mut relay);
    b.take_received();

    a.hang_up();
    c.send(b"x");
    let waits = net.waits();
    relay.poll_once(None).unwrap();

    assert_eq!(net.waits(), waits + 1);
    assert_eq!(b.take_text(), format!("{}3: x", leave_notice(ConnectionId(1))));
    assert_eq!(relay.registry().slot_of(ConnectionId(3)), Some(1));
    assert!(a.is_closed());
}

#[test]
fn nickname_metadata_survives_slot_moves() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();
    let _b = net.connect();
    settle(&mut relay);
    relay.registry_mut().info_mut(ConnectionId(2)).unwrap().nickname = Some("bea".to_string());

    a.hang_up();
    settle(&mut relay);

    let info = relay.registry().info(ConnectionId(2)).unwrap();
    assert_eq!(info.nickname.as_deref(), Some("bea"));
    assert_eq!(relay.registry().slot_of(ConnectionId(2)), Some(1));
}

#[test]
fn multiplexer_failure_is_fatal() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);

    net.fail_next_wait(ErrorKind::Other);
    let result = relay.poll_once(None);

    assert!(matches!(result, Err(ServerError::Multiplexer(_))));
}

#[test]
fn interrupted_wait_is_not_fatal() {
    let net = SimNetwork::new();
    let mut relay = relay(&net, 6);
    let a = net.connect();

    net.fail_next_wait(ErrorKind::Interrupted);
    relay.poll_once(None).unwrap();
    assert_eq!(relay.registry().count(), 1);

    let b = net.connect();
    settle(&mut relay);
    assert_eq!(relay.registry().count(), 3);
    assert_eq!(a.take_text(), JOIN);

    b.send(b"still here");
    settle(&mut relay);
    assert_eq!(a.take_text(), "2: still here");
}
