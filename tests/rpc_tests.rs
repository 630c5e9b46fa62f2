//! packrpc integration tests.
//!
//! Each test builds endpoint pairs on loopback UDP and drives both event
//! loops from the test thread.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use packrpc::{
    Error, HandlerMode, ReqFuncRegistry, ReqHandle, Rpc, RpcConfig, SessionState, SmEventKind,
};

use common::{connect, endpoint, endpoint_with_mtu, init_logging, payload, pump_until};

/// A registry whose only handler echoes the request payload.
fn echo_registry(req_type: u8, mode: HandlerMode) -> Arc<ReqFuncRegistry> {
    let mut registry = ReqFuncRegistry::new();
    registry
        .register(req_type, mode, |mut req, ctx| {
            let data = req.req_msgbuf().to_vec();
            if data.len() <= req.pre_resp_msgbuf.max_data_size() {
                req.pre_resp_msgbuf.copy_in(&data);
            } else {
                let mut buf = ctx.alloc_msg_buffer(data.len()).expect("alloc echo response");
                buf.copy_in(&data);
                req.dyn_resp_msgbuf = Some(buf);
                req.prealloc_used = false;
            }
            ctx.enqueue_response(req);
        })
        .unwrap();
    registry.freeze()
}

/// Enqueue one echo request and pump both sides until its continuation
/// fires. Returns the response payload.
fn echo_once(client: &Rpc, server: &Rpc, session: u16, req_type: u8, data: &[u8]) -> Vec<u8> {
    let mut req = client.alloc_msg_buffer(data.len()).unwrap();
    req.copy_in(data);
    let resp = client.alloc_msg_buffer(data.len().max(1)).unwrap();

    let result: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let sink = result.clone();
    client
        .enqueue_request(
            session,
            req_type,
            req,
            resp,
            move |rpc, handle| {
                sink.borrow_mut().replace(handle.resp_msgbuf.to_vec());
                rpc.release_response(handle);
            },
            0,
        )
        .unwrap();

    let ok = pump_until(&[client, server], Duration::from_secs(5), || {
        result.borrow().is_some()
    });
    assert!(ok, "no response within timeout");
    let out = result.borrow_mut().take().unwrap();
    out
}

// =============================================================================
// Small RPC
// =============================================================================

#[test]
fn test_small_rpc_echo() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint(&registry, 0, RpcConfig::default().with_rto_us(100_000));
    let client = endpoint(&registry, 1, RpcConfig::default().with_rto_us(100_000));

    let session = connect(&client.rpc, &server.rpc);

    let data = payload(32, 1);
    let echoed = echo_once(&client.rpc, &server.rpc, session, 1, &data);
    assert_eq!(echoed.len(), 32);
    assert_eq!(echoed, data);

    // One request packet out, one response packet back; no flow control
    // traffic for single-packet messages.
    let c = client.counts();
    let s = server.counts();
    assert_eq!(c.req, 1);
    assert_eq!(c.rfr, 0);
    assert_eq!(s.resp, 1);
    assert_eq!(s.ecr, 0);
}

#[test]
fn test_resize_shrinks_wire_payload() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint(&registry, 0, RpcConfig::default().with_rto_us(100_000));
    let client = endpoint(&registry, 1, RpcConfig::default().with_rto_us(100_000));

    let session = connect(&client.rpc, &server.rpc);

    // Fill 100 bytes, then shrink to 32: exactly 32 bytes reach the wire.
    let data = payload(100, 2);
    let mut req = client.rpc.alloc_msg_buffer(100).unwrap();
    req.copy_in(&data);
    req.resize(32);
    let resp = client.rpc.alloc_msg_buffer(100).unwrap();

    let result: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let sink = result.clone();
    client
        .rpc
        .enqueue_request(
            session,
            1,
            req,
            resp,
            move |rpc, handle| {
                sink.borrow_mut().replace(handle.resp_msgbuf.to_vec());
                rpc.release_response(handle);
            },
            0,
        )
        .unwrap();

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(5), || {
        result.borrow().is_some()
    });
    assert!(ok);
    let echoed = result.borrow_mut().take().unwrap();
    assert_eq!(echoed, &data[..32]);
}

// =============================================================================
// Large messages: credit-clocked requests, RFR-pulled responses
// =============================================================================

#[test]
fn test_large_message_credit_and_rfr_trace() {
    init_logging();
    // MTU of 1040 gives 1024 payload bytes per packet, so 16 KiB is
    // exactly 16 fragments. One credit: the first fragment goes out
    // immediately and each of the remaining 15 is clocked by an ECR.
    let config = RpcConfig::default()
        .with_session_credits(1)
        .with_rto_us(1_000_000);
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint_with_mtu(&registry, 0, config.clone(), 1040);
    let client = endpoint_with_mtu(&registry, 1, config, 1040);

    let session = connect(&client.rpc, &server.rpc);

    let data = payload(16 * 1024, 3);
    let echoed = echo_once(&client.rpc, &server.rpc, session, 1, &data);
    assert_eq!(echoed, data);

    let c = client.counts();
    let s = server.counts();
    // Request direction: 16 fragments, ECR-acked except the last.
    assert_eq!(c.req, 16);
    assert_eq!(s.ecr, 15);
    // Response direction: the first fragment is unsolicited, the other 15
    // are each pulled by an RFR.
    assert_eq!(s.resp, 16);
    assert_eq!(c.rfr, 15);
    assert_eq!(c.retransmits, 0);
    assert_eq!(s.retransmits, 0);
}

// =============================================================================
// Packet loss and retransmission
// =============================================================================

#[cfg(feature = "fault-injection")]
#[test]
fn test_drop_tx_local_retransmits_only_lost_fragment() {
    init_logging();
    let config = RpcConfig::default().with_rto_us(30_000);
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);

    // Three-fragment request; the third datapath transmission (fragment 2)
    // is dropped before it reaches the transport.
    client.rpc.fault_inject_drop_tx_local(3);

    let data = payload(2500, 4);
    let echoed = echo_once(&client.rpc, &server.rpc, session, 1, &data);
    assert_eq!(echoed, data);

    // Fragments 0 and 1 were acknowledged by ECR, so the timeout resends
    // only fragment 2.
    let c = client.counts();
    assert_eq!(c.req, 3); // two posted initially + one retransmission
    assert_eq!(c.retransmits, 1);
    assert_eq!(server.counts().ecr, 2);
}

#[cfg(feature = "fault-injection")]
#[test]
fn test_drop_tx_remote_recovers() {
    init_logging();
    let config = RpcConfig::default().with_rto_us(30_000);
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);

    // Ask the server to drop its next transmission (the response), then
    // let the SM packet land.
    client.rpc.fault_inject_drop_tx_remote(session, 1).unwrap();
    pump_until(&[&client.rpc, &server.rpc], Duration::from_millis(50), || false);

    let data = payload(64, 5);
    let echoed = echo_once(&client.rpc, &server.rpc, session, 1, &data);
    assert_eq!(echoed, data);
    assert!(client.counts().retransmits >= 1);
}

// =============================================================================
// Peer reset
// =============================================================================

#[cfg(feature = "fault-injection")]
#[test]
fn test_peer_reset_fails_inflight_requests_in_slot_order() {
    init_logging();
    let mut registry = ReqFuncRegistry::new();
    // Park inbound requests without responding so they stay in flight.
    let parked: Arc<Mutex<Vec<ReqHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = parked.clone();
    registry
        .register(2, HandlerMode::Foreground, move |req, _ctx| {
            sink.lock().unwrap().push(req);
        })
        .unwrap();
    let registry = registry.freeze();

    // Long RTO so the requests do not fail by retransmission exhaustion.
    let config = RpcConfig::default().with_rto_us(5_000_000);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);

    let failures: Rc<RefCell<Vec<(u64, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    for tag in 10..14u64 {
        let req = {
            let mut b = client.rpc.alloc_msg_buffer(32).unwrap();
            b.copy_in(&payload(32, tag));
            b
        };
        let resp = client.rpc.alloc_msg_buffer(32).unwrap();
        let sink = failures.clone();
        client
            .rpc
            .enqueue_request(
                session,
                2,
                req,
                resp,
                move |rpc, handle| {
                    sink.borrow_mut().push((handle.tag, handle.resp_msgbuf.data_size()));
                    rpc.release_response(handle);
                },
                tag,
            )
            .unwrap();
    }

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(2), || {
        parked.lock().unwrap().len() == 4
    });
    assert!(ok, "server never received all requests");

    // The server resets the peer: the client session fails and every
    // in-flight continuation fires with an empty response, slot order.
    server.rpc.fault_inject_reset_remote_peer(0).unwrap();
    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(2), || {
        failures.borrow().len() == 4
    });
    assert!(ok, "continuations never fired");

    assert_eq!(
        *failures.borrow(),
        vec![(10, 0), (11, 0), (12, 0), (13, 0)]
    );
    assert_eq!(client.rpc.session_state(session), Some(SessionState::Error));
    assert!(client
        .events()
        .iter()
        .any(|e| e.kind == SmEventKind::PeerReset));

    // The failed session rejects further requests.
    let req = client.rpc.alloc_msg_buffer(8).unwrap();
    let resp = client.rpc.alloc_msg_buffer(8).unwrap();
    let err = client
        .rpc
        .enqueue_request(session, 2, req, resp, |_, _| {}, 0)
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotConnected(_)));
}

// =============================================================================
// API restrictions in handler and continuation contexts
// =============================================================================

#[cfg(feature = "datapath-checks")]
#[test]
fn test_handler_and_continuation_restrictions() {
    init_logging();

    #[derive(Default)]
    struct Results {
        create_denied: bool,
        destroy_denied: bool,
        event_loop_panicked: bool,
    }

    let results: Arc<Mutex<Results>> = Arc::new(Mutex::new(Results::default()));
    let sink = results.clone();

    let mut registry = ReqFuncRegistry::new();
    registry
        .register(4, HandlerMode::Background, move |mut req, ctx| {
            let mut r = sink.lock().unwrap();
            r.create_denied = matches!(
                ctx.create_session("127.0.0.1:1", 0),
                Err(Error::PermissionDenied)
            );
            r.destroy_denied = matches!(ctx.destroy_session(0), Err(Error::PermissionDenied));
            r.event_loop_panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ctx.run_event_loop_once()
            }))
            .is_err();
            drop(r);

            let data = req.req_msgbuf().to_vec();
            req.pre_resp_msgbuf.copy_in(&data);
            ctx.enqueue_response(req);
        })
        .unwrap();
    let registry = registry.freeze();

    let config = RpcConfig::default().with_rto_us(100_000).with_bg_threads(1);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);
    let sessions_before = server.rpc.active_sessions();

    let data = payload(32, 6);
    let req = {
        let mut b = client.rpc.alloc_msg_buffer(32).unwrap();
        b.copy_in(&data);
        b
    };
    let resp = client.rpc.alloc_msg_buffer(32).unwrap();

    // The continuation checks the same restrictions on the foreground path.
    let cont_checks: Rc<RefCell<Option<(bool, bool, usize)>>> = Rc::new(RefCell::new(None));
    let cont_sink = cont_checks.clone();
    client
        .rpc
        .enqueue_request(
            session,
            4,
            req,
            resp,
            move |rpc, handle| {
                let create_denied = matches!(
                    rpc.create_session("127.0.0.1:1", 0),
                    Err(Error::PermissionDenied)
                );
                let loop_panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    rpc.run_event_loop_once()
                }))
                .is_err();
                cont_sink
                    .borrow_mut()
                    .replace((create_denied, loop_panicked, handle.resp_msgbuf.data_size()));
                rpc.release_response(handle);
            },
            0,
        )
        .unwrap();

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(5), || {
        cont_checks.borrow().is_some()
    });
    assert!(ok, "no response within timeout");

    let r = results.lock().unwrap();
    assert!(r.create_denied, "create_session allowed from background handler");
    assert!(r.destroy_denied, "destroy_session allowed from background handler");
    assert!(r.event_loop_panicked, "event loop ran from background handler");
    drop(r);

    // The denied calls must not have touched the session table.
    assert_eq!(server.rpc.active_sessions(), sessions_before);

    let (create_denied, loop_panicked, resp_size) = cont_checks.borrow_mut().take().unwrap();
    assert!(create_denied, "create_session allowed from continuation");
    assert!(loop_panicked, "event loop ran reentrantly from continuation");
    assert_eq!(resp_size, 32);
}

// =============================================================================
// Connect handshake: retries and failure
// =============================================================================

#[test]
fn test_connect_retry_with_delayed_server() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let config = RpcConfig::default()
        .with_sm_timeout_ms(500)
        .with_sm_max_retries(3);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = client
        .rpc
        .create_session(&server.rpc.sm_uri(), server.rpc.rpc_id())
        .unwrap();

    // The server does not poll for 1.2s, eating the first two attempts.
    let ok = pump_until(&[&client.rpc], Duration::from_millis(1200), || false);
    assert!(!ok);
    assert_eq!(
        client.rpc.session_state(session),
        Some(SessionState::ConnectInProgress)
    );

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(2), || {
        client.rpc.session_state(session) == Some(SessionState::Connected)
    });
    assert!(ok, "connect never completed after the server came up");

    // Duplicate connect requests were deduplicated: success reported once.
    let connected = client
        .events()
        .iter()
        .filter(|e| e.kind == SmEventKind::Connected)
        .count();
    assert_eq!(connected, 1);

    let data = payload(16, 7);
    assert_eq!(echo_once(&client.rpc, &server.rpc, session, 1, &data), data);
}

#[test]
fn test_connect_timeout_reports_failure_once() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let config = RpcConfig::default()
        .with_sm_timeout_ms(100)
        .with_sm_max_retries(2);
    let client = endpoint(&registry, 1, config);

    // UDP discard port: nothing will ever answer.
    let session = client.rpc.create_session("127.0.0.1:9", 0).unwrap();

    let ok = pump_until(&[&client.rpc], Duration::from_secs(2), || {
        client.rpc.session_state(session) == Some(SessionState::Error)
    });
    assert!(ok, "connect never timed out");

    let failures = client
        .events()
        .iter()
        .filter(|e| e.kind == SmEventKind::ConnectFailed)
        .count();
    assert_eq!(failures, 1);
}

#[cfg(feature = "fault-injection")]
#[test]
fn test_stale_routing_info_connect_retries() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let config = RpcConfig::default()
        .with_sm_timeout_ms(100)
        .with_sm_max_retries(3);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    // The first connect attempt carries wrong routing info; the retry
    // resolves correctly.
    client.rpc.fault_inject_resolve_server_rinfo();
    let session = client
        .rpc
        .create_session(&server.rpc.sm_uri(), server.rpc.rpc_id())
        .unwrap();

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(2), || {
        client.rpc.session_state(session) == Some(SessionState::Connected)
    });
    assert!(ok, "connect never recovered from stale routing info");
    assert_eq!(
        client
            .events()
            .iter()
            .filter(|e| e.kind == SmEventKind::Connected)
            .count(),
        1
    );
}

// =============================================================================
// Request window
// =============================================================================

#[test]
fn test_request_window_bounds_inflight_requests() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let config = RpcConfig::default().with_req_window(2).with_rto_us(100_000);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);

    let completions: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));
    let send = |tag: u64| -> packrpc::Result<()> {
        let mut req = client.rpc.alloc_msg_buffer(16)?;
        req.copy_in(&payload(16, tag));
        let resp = client.rpc.alloc_msg_buffer(16)?;
        let sink = completions.clone();
        client.rpc.enqueue_request(
            session,
            1,
            req,
            resp,
            move |rpc, handle| {
                *sink.borrow_mut() += 1;
                rpc.release_response(handle);
            },
            tag,
        )
    };

    // Two slots fill the window; the third is rejected until one drains.
    send(0).unwrap();
    send(1).unwrap();
    assert!(matches!(send(2), Err(Error::NoFreeSlots)));

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(5), || {
        *completions.borrow() == 2
    });
    assert!(ok);

    send(3).unwrap();
    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(5), || {
        *completions.borrow() == 3
    });
    assert!(ok);
}

// =============================================================================
// Background handlers
// =============================================================================

#[test]
fn test_background_echo() {
    init_logging();
    let registry = echo_registry(5, HandlerMode::Background);
    let config = RpcConfig::default().with_rto_us(200_000).with_bg_threads(2);
    let server = endpoint(&registry, 0, config.clone());
    let client = endpoint(&registry, 1, config);

    let session = connect(&client.rpc, &server.rpc);

    let results: Rc<RefCell<Vec<(u64, Vec<u8>)>>> = Rc::new(RefCell::new(Vec::new()));
    let mut expected = Vec::new();
    for tag in 0..8u64 {
        let size = if tag % 2 == 0 { 32 } else { 3000 };
        let data = payload(size, 100 + tag);
        expected.push((tag, data.clone()));

        let mut req = client.rpc.alloc_msg_buffer(size).unwrap();
        req.copy_in(&data);
        let resp = client.rpc.alloc_msg_buffer(size).unwrap();
        let sink = results.clone();
        client
            .rpc
            .enqueue_request(
                session,
                5,
                req,
                resp,
                move |rpc, handle| {
                    sink.borrow_mut().push((handle.tag, handle.resp_msgbuf.to_vec()));
                    rpc.release_response(handle);
                },
                tag,
            )
            .unwrap();
    }

    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(5), || {
        results.borrow().len() == 8
    });
    assert!(ok, "not all background responses arrived");

    let mut got = results.borrow().clone();
    got.sort_by_key(|(tag, _)| *tag);
    assert_eq!(got, expected);
}

// =============================================================================
// Disconnect
// =============================================================================

#[test]
fn test_disconnect_handshake() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let server = endpoint(&registry, 0, RpcConfig::default());
    let client = endpoint(&registry, 1, RpcConfig::default());

    let session = connect(&client.rpc, &server.rpc);
    assert_eq!(client.rpc.active_sessions(), 1);
    assert_eq!(server.rpc.active_sessions(), 1);

    client.rpc.destroy_session(session).unwrap();
    let ok = pump_until(&[&client.rpc, &server.rpc], Duration::from_secs(2), || {
        client
            .events()
            .iter()
            .any(|e| e.kind == SmEventKind::Disconnected)
    });
    assert!(ok, "disconnect never completed");

    assert_eq!(client.rpc.active_sessions(), 0);
    assert_eq!(server.rpc.active_sessions(), 0);
    assert_eq!(client.rpc.session_state(session), None);
}

// =============================================================================
// Caller-misuse errors
// =============================================================================

#[test]
fn test_caller_misuse_errors() {
    init_logging();
    let registry = echo_registry(1, HandlerMode::Foreground);
    let client = endpoint(&registry, 1, RpcConfig::default());

    // Unknown session.
    let req = client.rpc.alloc_msg_buffer(8).unwrap();
    let resp = client.rpc.alloc_msg_buffer(8).unwrap();
    let err = client
        .rpc
        .enqueue_request(99, 1, req, resp, |_, _| {}, 0)
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(99)));

    // Unresolvable remote URI.
    let err = client.rpc.create_session("not a uri", 0).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Destroying a session that does not exist.
    let err = client.rpc.destroy_session(42).unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(42)));

    // Empty requests are rejected.
    let mut req = client.rpc.alloc_msg_buffer(8).unwrap();
    req.resize(0);
    let resp = client.rpc.alloc_msg_buffer(8).unwrap();
    let err = client
        .rpc
        .enqueue_request(99, 1, req, resp, |_, _| {}, 0)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
