use super::{ReactorTask, shutdown_error};
use crate::call::{CallController, OutboundCall};
use crate::connection::{Connection, ConnectionId, UserCredentials};
use crate::frame::{self, Frame};
use crate::messenger::Messenger;
use crate::negotiation::{ConnectionNegotiator, NegotiatedContext, PlainNegotiator};
use crate::service::{BoundedServiceQueue, DiscardingDispatch, InboundDispatch};
use googletest::prelude::*;
use rstest::rstest;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strand_common::config::MessengerConfig;

fn test_config(name: &str) -> MessengerConfig {
    MessengerConfig {
        name: name.to_owned(),
        reactor_count: 1,
        negotiation_pool_size: 1,
        connection_keepalive_time: Duration::from_secs(5),
        coarse_timer_granularity: Duration::from_millis(20),
        server_negotiation_timeout_ms: 1000,
    }
}

fn client_messenger(name: &str) -> Messenger {
    Messenger::start(
        &test_config(name),
        Arc::new(DiscardingDispatch),
        Arc::new(PlainNegotiator),
    )
    .expect("messenger should start")
}

fn echo_conn_id(remote: SocketAddr) -> ConnectionId {
    ConnectionId::new(remote, "echo", UserCredentials::new("alice"))
}

fn new_call(remote: SocketAddr, timeout: Duration) -> (OutboundCall, crate::call::CallReceiver) {
    OutboundCall::new(
        echo_conn_id(remote),
        "Echo",
        b"hello".to_vec(),
        CallController::new(Some(timeout)),
    )
}

/// Polls `probe` until it holds or `limit` elapses.
fn eventually(limit: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Blocks on a raw test-peer socket until one full frame arrives. The buffer
/// persists across calls so back-to-back frames read in one chunk survive.
fn read_one_frame(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> Frame {
    let mut chunk = [0_u8; 256];
    loop {
        if let Some(frame) = frame::decode_frame(buffer).expect("peer frame must decode") {
            return frame;
        }
        let read_len = socket.read(&mut chunk).expect("peer read should succeed");
        assert!(read_len > 0, "connection closed before a full frame arrived");
        buffer.extend_from_slice(&chunk[..read_len]);
    }
}

#[rstest]
fn get_metrics_samples_an_empty_reactor() {
    let messenger = client_messenger("metrics");
    let metrics = messenger.get_metrics().expect("metrics should sample");
    assert_that!(metrics.num_client_connections, eq(0_usize));
    assert_that!(metrics.num_server_connections, eq(0_usize));
}

#[rstest]
fn tasks_scheduled_after_shutdown_abort_on_the_caller() {
    let messenger = client_messenger("late-tasks");
    messenger.shutdown();

    let error = messenger
        .get_metrics()
        .expect_err("metrics after shutdown must fail");
    assert_that!(
        format!("{error}").contains("reactor is shutting down"),
        eq(true)
    );

    let remote = SocketAddr::from(([127, 0, 0, 1], 1));
    let (call, receiver) = new_call(remote, Duration::from_secs(1));
    messenger.queue_outbound_call(call);
    let status = receiver.wait().expect_err("late call must fail");
    assert_that!(
        format!("{status}").contains("reactor is shutting down"),
        eq(true)
    );
    assert_that!(messenger.metrics().tasks_aborted() >= 2, eq(true));
}

#[rstest]
fn reactor_shutdown_is_idempotent() {
    let messenger = client_messenger("idempotent");
    messenger.shutdown();
    messenger.shutdown();
    messenger.shutdown();

    let error = messenger
        .get_metrics()
        .expect_err("metrics after repeated shutdown must fail");
    assert_that!(
        format!("{error}").contains("reactor is shutting down"),
        eq(true)
    );
}

#[rstest]
fn aborted_inbound_registration_closes_the_socket() {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    let mut peer = TcpStream::connect(addr).expect("connect should succeed");
    let (accepted, accepted_peer) = listener.accept().expect("accept should succeed");

    let conn = Connection::inbound(accepted_peer, accepted, Instant::now());
    ReactorTask::RegisterConnection { conn }.abort(shutdown_error());

    peer.set_read_timeout(Some(Duration::from_secs(2)))
        .expect("peer read timeout should arm");
    let mut chunk = [0_u8; 8];
    let read_len = peer.read(&mut chunk).expect("peer read should observe EOF");
    assert_that!(read_len, eq(0_usize));
}

#[rstest]
fn outbound_call_fails_when_nothing_listens() {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    drop(listener);

    let messenger = client_messenger("refused");
    let (call, receiver) = new_call(addr, Duration::from_secs(2));
    messenger.queue_outbound_call(call);

    let status = receiver
        .wait_timeout(Duration::from_secs(5))
        .expect_err("call against a dead port must fail");
    assert_that!(format!("{status}").contains("Network error"), eq(true));
}

#[rstest]
fn calls_round_trip_through_a_negotiated_connection() {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");

    let server = thread::spawn(move || {
        let (mut socket, _peer) = listener.accept().expect("accept should succeed");
        let context = PlainNegotiator
            .negotiate_server(&mut socket, Instant::now() + Duration::from_secs(2))
            .expect("server handshake should succeed");
        assert_eq!(context.service_name, "echo");
        assert_eq!(context.user_credentials.real_user(), "alice");

        let mut buffer = Vec::new();
        let Frame::Request {
            call_id,
            method,
            payload,
        } = read_one_frame(&mut socket, &mut buffer)
        else {
            panic!("expected a request frame");
        };
        assert_eq!(method, "Echo");

        let mut reply = Vec::new();
        frame::encode_response_ok(&mut reply, call_id, &payload).expect("reply must encode");
        socket.write_all(&reply).expect("reply write should succeed");
    });

    let messenger = client_messenger("roundtrip");
    let (call, receiver) = new_call(addr, Duration::from_secs(5));
    messenger.queue_outbound_call(call);

    let payload = receiver
        .wait_timeout(Duration::from_secs(5))
        .expect("call should complete");
    assert_that!(&payload, eq(&b"hello".to_vec()));
    server.join().expect("server thread must not panic");
}

#[rstest]
fn concurrent_calls_for_one_remote_share_a_connection() {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");

    let server = thread::spawn(move || {
        let (mut socket, _peer) = listener.accept().expect("accept should succeed");
        drop(listener);
        let _context = PlainNegotiator
            .negotiate_server(&mut socket, Instant::now() + Duration::from_secs(2))
            .expect("server handshake should succeed");

        let mut buffer = Vec::new();
        for _ in 0..2 {
            let Frame::Request { call_id, payload, .. } = read_one_frame(&mut socket, &mut buffer)
            else {
                panic!("expected a request frame");
            };
            let mut reply = Vec::new();
            frame::encode_response_ok(&mut reply, call_id, &payload).expect("reply must encode");
            socket.write_all(&reply).expect("reply write should succeed");
        }
    });

    let messenger = client_messenger("shared-conn");
    let (first_call, first_receiver) = new_call(addr, Duration::from_secs(5));
    let (second_call, second_receiver) = new_call(addr, Duration::from_secs(5));
    messenger.queue_outbound_call(first_call);
    messenger.queue_outbound_call(second_call);

    first_receiver
        .wait_timeout(Duration::from_secs(5))
        .expect("first call should complete");
    second_receiver
        .wait_timeout(Duration::from_secs(5))
        .expect("second call should complete");

    let metrics = messenger.get_metrics().expect("metrics should sample");
    assert_that!(metrics.num_client_connections, eq(1_usize));
    server.join().expect("server thread must not panic");
}

#[rstest]
fn inbound_connection_negotiates_and_dispatches_calls() {
    let queue = Arc::new(BoundedServiceQueue::new(8));
    let dispatch: Arc<dyn InboundDispatch> = Arc::clone(&queue) as Arc<dyn InboundDispatch>;
    let messenger = Messenger::start(&test_config("server"), dispatch, Arc::new(PlainNegotiator))
        .expect("messenger should start");

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    let mut peer = TcpStream::connect(addr).expect("connect should succeed");
    let (accepted, accepted_peer) = listener.accept().expect("accept should succeed");
    messenger.register_inbound_socket(accepted, accepted_peer);

    let context = NegotiatedContext {
        service_name: "calc".to_owned(),
        user_credentials: UserCredentials::new("bob"),
    };
    PlainNegotiator
        .negotiate_client(&mut peer, &context, Instant::now() + Duration::from_secs(2))
        .expect("peer handshake should succeed");

    let mut wire = Vec::new();
    frame::encode_request(&mut wire, 1, "Add", b"1+2").expect("request must encode");
    peer.write_all(&wire).expect("request write should succeed");

    assert_that!(
        eventually(Duration::from_secs(2), || !queue.is_empty()),
        eq(true)
    );
    let call = queue.pop().expect("dispatched call must be present");
    assert_that!(call.method.as_str(), eq("Add"));
    assert_that!(&call.payload, eq(&b"1+2".to_vec()));

    let metrics = messenger.get_metrics().expect("metrics should sample");
    assert_that!(metrics.num_server_connections, eq(1_usize));
    assert_that!(messenger.metrics().connections_accepted(), eq(1_u64));
}

#[rstest]
fn silent_inbound_peer_is_destroyed_after_negotiation_timeout() {
    let mut config = test_config("neg-timeout");
    config.server_negotiation_timeout_ms = 150;
    let messenger = Messenger::start(
        &config,
        Arc::new(DiscardingDispatch),
        Arc::new(PlainNegotiator),
    )
    .expect("messenger should start");

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    let _silent_peer = TcpStream::connect(addr).expect("connect should succeed");
    let (accepted, accepted_peer) = listener.accept().expect("accept should succeed");
    messenger.register_inbound_socket(accepted, accepted_peer);

    assert_that!(
        eventually(Duration::from_secs(3), || {
            messenger
                .get_metrics()
                .map(|metrics| metrics.num_server_connections == 0)
                .unwrap_or(false)
        }),
        eq(true)
    );
}

#[rstest]
fn idle_inbound_connection_is_reaped_after_keepalive() {
    let mut config = test_config("reaper");
    config.connection_keepalive_time = Duration::from_millis(100);
    config.coarse_timer_granularity = Duration::from_millis(20);
    let messenger = Messenger::start(
        &config,
        Arc::new(DiscardingDispatch),
        Arc::new(PlainNegotiator),
    )
    .expect("messenger should start");

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    let mut peer = TcpStream::connect(addr).expect("connect should succeed");
    let (accepted, accepted_peer) = listener.accept().expect("accept should succeed");
    messenger.register_inbound_socket(accepted, accepted_peer);

    let context = NegotiatedContext {
        service_name: "calc".to_owned(),
        user_credentials: UserCredentials::new("bob"),
    };
    PlainNegotiator
        .negotiate_client(&mut peer, &context, Instant::now() + Duration::from_secs(2))
        .expect("peer handshake should succeed");

    assert_that!(
        eventually(Duration::from_secs(2), || {
            messenger
                .get_metrics()
                .map(|metrics| metrics.num_server_connections == 0)
                .unwrap_or(false)
        }),
        eq(true)
    );

    // The reaped connection's socket is closed; the peer observes EOF.
    peer.set_read_timeout(Some(Duration::from_secs(2)))
        .expect("peer read timeout should arm");
    let mut chunk = [0_u8; 8];
    let read_len = peer.read(&mut chunk).unwrap_or(0);
    assert_that!(read_len, eq(0_usize));
}

#[rstest]
fn service_queue_overflow_is_reported_to_the_caller() {
    let queue = Arc::new(BoundedServiceQueue::new(1));
    let dispatch: Arc<dyn InboundDispatch> = Arc::clone(&queue) as Arc<dyn InboundDispatch>;
    let messenger = Messenger::start(&test_config("overflow"), dispatch, Arc::new(PlainNegotiator))
        .expect("messenger should start");

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    let mut peer = TcpStream::connect(addr).expect("connect should succeed");
    let (accepted, accepted_peer) = listener.accept().expect("accept should succeed");
    messenger.register_inbound_socket(accepted, accepted_peer);

    let context = NegotiatedContext {
        service_name: "calc".to_owned(),
        user_credentials: UserCredentials::new("bob"),
    };
    PlainNegotiator
        .negotiate_client(&mut peer, &context, Instant::now() + Duration::from_secs(2))
        .expect("peer handshake should succeed");

    let mut wire = Vec::new();
    frame::encode_request(&mut wire, 1, "Add", b"1+2").expect("request must encode");
    frame::encode_request(&mut wire, 2, "Add", b"3+4").expect("request must encode");
    peer.write_all(&wire).expect("request write should succeed");

    let mut buffer = Vec::new();
    let Frame::ResponseError { call_id, message } = read_one_frame(&mut peer, &mut buffer) else {
        panic!("expected an error response for the overflowing call");
    };
    assert_that!(call_id, eq(2_u64));
    assert_that!(message.contains("service queue is full"), eq(true));
    assert_that!(queue.len(), eq(1_usize));
}

#[rstest]
fn hammering_clients_terminate_cleanly_when_the_server_dies() {
    let queue = Arc::new(BoundedServiceQueue::new(64));
    let dispatch: Arc<dyn InboundDispatch> = Arc::clone(&queue) as Arc<dyn InboundDispatch>;
    let server = Arc::new(
        Messenger::start(&test_config("hammer-server"), dispatch, Arc::new(PlainNegotiator))
            .expect("server messenger should start"),
    );

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    listener
        .set_nonblocking(true)
        .expect("acceptor listener should be nonblocking");

    let stop_accepting = Arc::new(AtomicBool::new(false));
    let acceptor = {
        let server = Arc::clone(&server);
        let stop_accepting = Arc::clone(&stop_accepting);
        thread::spawn(move || {
            loop {
                match listener.accept() {
                    Ok((socket, peer)) => server.register_inbound_socket(socket, peer),
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        if stop_accepting.load(Ordering::Acquire) {
                            break;
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        })
    };

    let client = Arc::new(client_messenger("hammer-client"));
    let mut hammers = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        hammers.push(thread::spawn(move || {
            let (call, receiver) = new_call(addr, Duration::from_secs(10));
            client.queue_outbound_call(call);
            receiver
                .wait_timeout(Duration::from_secs(15))
                .expect_err("hammer call must terminate with an error")
        }));
    }

    thread::sleep(Duration::from_millis(50));
    server.shutdown();
    stop_accepting.store(true, Ordering::Release);
    acceptor.join().expect("acceptor thread must not panic");

    for hammer in hammers {
        let status = hammer.join().expect("hammer thread must not panic");
        let text = format!("{status}");
        assert_that!(
            text.contains("Network error") || text.contains("Service unavailable"),
            eq(true)
        );
    }
    client.shutdown();
}

#[rstest]
fn client_shutdown_mid_negotiation_fails_the_call_cleanly() {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .expect("listener bind should succeed");
    let addr = listener.local_addr().expect("listener must expose local addr");
    // Accept but never negotiate, so the client handshake stays in flight.
    let holder = thread::spawn(move || listener.accept().map(|(socket, _)| socket));

    let messenger = client_messenger("mid-negotiation");
    let (call, receiver) = new_call(addr, Duration::from_millis(300));
    messenger.queue_outbound_call(call);
    messenger.shutdown();

    let status = receiver
        .wait_timeout(Duration::from_secs(5))
        .expect_err("call must fail once the messenger is gone");
    let text = format!("{status}");
    assert_that!(
        text.contains("reactor is shutting down")
            || text.contains("Client RPC Messenger shutting down")
            || text.contains("Unable to start connection negotiation thread")
            || text.contains("connection negotiation timed out")
            || text.contains("Network error"),
        eq(true)
    );
    drop(holder);
}

#[rstest]
fn metrics_sampling_races_shutdown_without_hanging() {
    let messenger = Arc::new(client_messenger("metrics-race"));
    let sampler = {
        let messenger = Arc::clone(&messenger);
        thread::spawn(move || {
            let mut observed_error = false;
            for _ in 0..50 {
                match messenger.get_metrics() {
                    Ok(metrics) => {
                        assert!(metrics.num_client_connections == 0);
                    }
                    Err(_) => observed_error = true,
                }
            }
            observed_error
        })
    };

    thread::sleep(Duration::from_millis(2));
    messenger.shutdown();
    // The sampler must terminate: every probe resolves to a count or a
    // shutdown status, never an indefinite block.
    let _observed_error = sampler.join().expect("sampler thread must not panic");
}
