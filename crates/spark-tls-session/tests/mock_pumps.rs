//! 基于替身引擎的会话泵行为测试：分段不变性、往返一致性、握手前不投递与拆除安全。

mod common;

use proptest::prelude::*;
use spark_tls_session::{
    ChannelId, EncryptOutcome, HandshakeStatus, Role, Session, SessionError,
    testing::{self, AllocationTracker, DeliveryLog, FaultPlan, MockContext, MockEngine},
};

use common::{complete_handshake, shuttle};

struct Pair {
    client: Session<MockEngine>,
    server: Session<MockEngine>,
    client_log: DeliveryLog,
    server_log: DeliveryLog,
    tracker: AllocationTracker,
}

fn pair(plan: FaultPlan) -> Pair {
    let context = MockContext::new(plan);
    let tracker = context.tracker().clone();
    let client_log = DeliveryLog::default();
    let server_log = DeliveryLog::default();
    let client = Session::create(&context, ChannelId::new(1), Role::Client, client_log.callback())
        .expect("client");
    let server = Session::create(&context, ChannelId::new(2), Role::Server, server_log.callback())
        .expect("server");
    Pair {
        client,
        server,
        client_log,
        server_log,
        tracker,
    }
}

fn established(plan: FaultPlan) -> Pair {
    let mut pair = pair(plan);
    complete_handshake(&mut pair.client, &mut pair.server, usize::MAX).expect("handshake");
    pair
}

#[test]
fn plaintext_queued_before_handshake_waits_for_establishment() {
    let mut pair = pair(FaultPlan::default());
    pair.client.queue_plaintext(b"hello");
    assert_eq!(pair.client.pump_encrypt().expect("pump"), EncryptOutcome::Idle);
    assert_eq!(pair.client.pending_plaintext(), 5);
    assert_eq!(pair.client.pending_ciphertext(), 0);
    assert_eq!(pair.tracker.encrypt_calls(), 0);

    complete_handshake(&mut pair.client, &mut pair.server, usize::MAX).expect("handshake");
    assert_eq!(pair.client.pending_plaintext(), 5);

    assert_eq!(pair.client.pump_encrypt().expect("pump"), EncryptOutcome::Flushed);
    shuttle(&mut pair.client, &mut pair.server, usize::MAX).expect("deliver");
    assert_eq!(pair.server_log.concatenated(), b"hello");
}

#[test]
fn large_handshake_flight_in_small_chunks_establishes() {
    let plan = FaultPlan {
        hello_len: 4096 - testing::RECORD_HEADER_LEN,
        ..FaultPlan::default()
    };
    let flight = testing::client_hello(&plan);
    assert_eq!(flight.len(), 4096);

    let context = MockContext::new(plan);
    let mut chunked =
        Session::create(&context, ChannelId::new(3), Role::Server, |_: &[u8]| {}).expect("server");
    for piece in flight.chunks(7) {
        chunked.on_ciphertext_received(piece).expect("chunk");
    }
    let mut whole =
        Session::create(&context, ChannelId::new(4), Role::Server, |_: &[u8]| {}).expect("server");
    whole.on_ciphertext_received(&flight).expect("flight");

    assert!(chunked.is_established());
    assert!(whole.is_established());
    assert_eq!(chunked.drive_handshake().expect("step"), HandshakeStatus::Established);
    assert_eq!(chunked.outgoing_ciphertext(), whole.outgoing_ciphertext());
}

#[test]
fn conduit_write_failure_surfaces_as_error() {
    let plan = FaultPlan {
        reject_inbound_after: Some(10),
        ..FaultPlan::default()
    };
    let context = MockContext::new(plan.clone());
    let mut server =
        Session::create(&context, ChannelId::new(5), Role::Server, |_: &[u8]| {}).expect("server");
    let error = server
        .on_ciphertext_received(&testing::client_hello(&plan))
        .expect_err("conduit refuses");
    assert!(matches!(error, SessionError::ConduitWriteFailed { .. }));
    server.destroy();
    assert_eq!(context.tracker().live_engines(), 0);
}

#[test]
fn back_to_back_messages_arrive_in_order() {
    for limit in [None, Some(1)] {
        let mut pair = established(FaultPlan {
            encrypt_accept_limit: limit,
            ..FaultPlan::default()
        });
        pair.client.queue_plaintext(b"A");
        pair.client.queue_plaintext(b"BB");
        assert_eq!(pair.client.pump_encrypt().expect("pump"), EncryptOutcome::Flushed);
        shuttle(&mut pair.client, &mut pair.server, usize::MAX).expect("deliver");
        assert_eq!(pair.server_log.concatenated(), b"ABB");
    }
}

#[test]
fn server_replies_reach_the_client() {
    let mut pair = established(FaultPlan::default());
    pair.server.queue_plaintext(b"pong");
    pair.server.pump_encrypt().expect("pump");
    shuttle(&mut pair.server, &mut pair.client, 3).expect("deliver");
    assert_eq!(pair.client_log.concatenated(), b"pong");
}

#[test]
fn close_propagates_as_peer_closed() {
    let mut pair = established(FaultPlan::default());
    pair.client.queue_plaintext(b"last words");
    pair.client.pump_encrypt().expect("pump");
    pair.client.close().expect("close");
    let error = shuttle(&mut pair.client, &mut pair.server, usize::MAX).expect_err("closed");
    assert!(matches!(error, SessionError::PeerClosed));
    assert_eq!(pair.server_log.concatenated(), b"last words");
}

#[test]
fn teardown_at_every_stage_releases_resources() {
    let stages = 0..6;
    for stage in stages {
        let mut pair = pair(FaultPlan::default());
        let tracker = pair.tracker.clone();
        if stage >= 1 {
            pair.client.drive_handshake().expect("hello");
        }
        if stage >= 2 {
            shuttle(&mut pair.client, &mut pair.server, 5).expect("to server");
        }
        if stage >= 3 {
            shuttle(&mut pair.server, &mut pair.client, 5).expect("to client");
        }
        if stage >= 4 {
            pair.client.queue_plaintext(b"payload");
            pair.client.pump_encrypt().expect("pump");
        }
        if stage >= 5 {
            shuttle(&mut pair.client, &mut pair.server, 2).expect("payload");
        }
        assert_eq!(tracker.live_engines(), 2);
        assert_eq!(tracker.live_conduits(), 4);
        pair.client.destroy();
        drop(pair.server);
        assert_eq!(tracker.live_engines(), 0, "stage {stage}");
        assert_eq!(tracker.live_conduits(), 0, "stage {stage}");
    }
}

fn transcript(chunk: usize, messages: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut pair = established(FaultPlan::default());
    for message in messages {
        pair.client.queue_plaintext(message);
        pair.client.pump_encrypt().expect("pump");
    }
    shuttle(&mut pair.client, &mut pair.server, chunk).expect("deliver");
    (pair.server_log.chunks(), pair.server_log.concatenated())
}

proptest! {
    #[test]
    fn prop_round_trip_in_any_chunking(
        payload in proptest::collection::vec(any::<u8>(), 0..512),
        chunk in 1usize..64,
    ) {
        let mut pair = established(FaultPlan::default());
        pair.client.queue_plaintext(&payload);
        pair.client.pump_encrypt().expect("pump");
        shuttle(&mut pair.client, &mut pair.server, chunk).expect("deliver");
        prop_assert_eq!(pair.server_log.concatenated(), payload);
    }

    #[test]
    fn prop_single_byte_chunks_match_one_block(
        messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..40), 1..6),
    ) {
        let (whole_chunks, whole) = transcript(usize::MAX, &messages);
        let (pieces, split) = transcript(1, &messages);
        prop_assert_eq!(&whole, &split);
        prop_assert_eq!(whole, messages.concat());
        prop_assert!(pieces.iter().all(|piece| !piece.is_empty()));
        prop_assert_eq!(whole_chunks, pieces);
    }

    #[test]
    fn prop_nothing_is_delivered_before_establishment(
        hello_len in 1usize..96,
        chunk in 1usize..16,
    ) {
        let plan = FaultPlan { hello_len, ..FaultPlan::default() };
        let context = MockContext::new(plan.clone());
        let log = DeliveryLog::default();
        let mut server = Session::create(&context, ChannelId::new(8), Role::Server, log.callback())
            .expect("server");
        let hello = testing::client_hello(&plan);
        let mut stream = hello.clone();
        stream.extend(testing::application_record(b"data"));

        for (index, piece) in stream.chunks(chunk).enumerate() {
            server.on_ciphertext_received(piece).expect("chunk");
            let fed = ((index + 1) * chunk).min(stream.len());
            if fed < hello.len() {
                prop_assert!(!server.is_established());
                prop_assert!(log.chunks().is_empty());
            }
        }
        prop_assert_eq!(log.concatenated(), b"data".to_vec());
    }

    #[test]
    fn prop_empty_pump_never_touches_engine(rounds in 1usize..8) {
        let mut pair = established(FaultPlan::default());
        for _ in 0..rounds {
            prop_assert_eq!(pair.client.pump_encrypt().expect("pump"), EncryptOutcome::Idle);
        }
        prop_assert_eq!(pair.tracker.encrypt_calls(), 0);
        prop_assert!(!pair.client.wants_write());
    }
}
