//! Common test utilities for packrpc integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use packrpc::{
    PktFlags, PktHdr, PktType, ReqFuncRegistry, RouteInfo, Rpc, RpcConfig, SessionState, SmEvent,
    SmEventHandler, Transport, UdpTransport,
};

/// Default test MTU.
pub const TEST_MTU: usize = 1024;

/// Transmitted-packet counters, by type.
#[derive(Debug, Default, Clone, Copy)]
pub struct TxCounts {
    pub req: usize,
    pub resp: usize,
    pub rfr: usize,
    pub ecr: usize,
    pub retransmits: usize,
}

/// Transport wrapper recording the endpoint's transmitted wire trace.
pub struct CountingTransport {
    inner: UdpTransport,
    counts: Rc<RefCell<TxCounts>>,
}

impl CountingTransport {
    pub fn new(inner: UdpTransport, counts: Rc<RefCell<TxCounts>>) -> Self {
        Self { inner, counts }
    }
}

impl Transport for CountingTransport {
    fn mtu(&self) -> usize {
        self.inner.mtu()
    }

    fn local_route(&self) -> RouteInfo {
        self.inner.local_route()
    }

    fn post_tx(&mut self, route: &RouteInfo, pkt: &[u8]) -> packrpc::Result<()> {
        if let Ok(hdr) = PktHdr::read_from(pkt) {
            let mut counts = self.counts.borrow_mut();
            match hdr.pkt_type {
                PktType::Req => counts.req += 1,
                PktType::Resp => counts.resp += 1,
                PktType::Rfr => counts.rfr += 1,
                PktType::Ecr => counts.ecr += 1,
                PktType::Sm => {}
            }
            if hdr.flags.contains(PktFlags::RETRANSMIT) {
                counts.retransmits += 1;
            }
        }
        self.inner.post_tx(route, pkt)
    }

    fn poll_rx(&mut self, buf: &mut [u8]) -> packrpc::Result<Option<(usize, RouteInfo)>> {
        self.inner.poll_rx(buf)
    }

    fn tx_flush(&mut self) -> packrpc::Result<()> {
        self.inner.tx_flush()
    }
}

/// A test endpoint with an observable wire trace and SM events.
pub struct TestEndpoint {
    pub rpc: Rpc,
    pub tx_counts: Rc<RefCell<TxCounts>>,
    pub events: Rc<RefCell<Vec<SmEvent>>>,
}

impl TestEndpoint {
    pub fn counts(&self) -> TxCounts {
        *self.tx_counts.borrow()
    }

    pub fn events(&self) -> Vec<SmEvent> {
        self.events.borrow().clone()
    }
}

/// Build an endpoint on loopback with ephemeral ports.
pub fn endpoint(registry: &Arc<ReqFuncRegistry>, rpc_id: u8, config: RpcConfig) -> TestEndpoint {
    endpoint_with_mtu(registry, rpc_id, config, TEST_MTU)
}

pub fn endpoint_with_mtu(
    registry: &Arc<ReqFuncRegistry>,
    rpc_id: u8,
    config: RpcConfig,
    mtu: usize,
) -> TestEndpoint {
    let tx_counts = Rc::new(RefCell::new(TxCounts::default()));
    let transport = CountingTransport::new(
        UdpTransport::bind("127.0.0.1:0", mtu).expect("bind datapath socket"),
        tx_counts.clone(),
    );

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    let sm_handler: SmEventHandler = Box::new(move |event: SmEvent| sink.borrow_mut().push(event));

    let rpc = Rpc::new(
        registry.clone(),
        Box::new(transport),
        "127.0.0.1:0",
        rpc_id,
        config,
        Some(sm_handler),
    )
    .expect("create endpoint");

    TestEndpoint {
        rpc,
        tx_counts,
        events,
    }
}

/// Run all endpoints' event loops until `done` returns true or `timeout`
/// elapses. Returns whether `done` was reached.
pub fn pump_until(
    rpcs: &[&Rpc],
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let start = Instant::now();
    loop {
        for rpc in rpcs {
            rpc.run_event_loop_once();
        }
        if done() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// Connect a client session to `server` and pump both sides until the
/// handshake completes.
pub fn connect(client: &Rpc, server: &Rpc) -> u16 {
    let session_num = client
        .create_session(&server.sm_uri(), server.rpc_id())
        .expect("create_session");
    let ok = pump_until(&[client, server], Duration::from_secs(2), || {
        client.session_state(session_num) == Some(SessionState::Connected)
    });
    assert!(ok, "session never connected");
    session_num
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}
