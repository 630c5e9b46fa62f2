//! The RPC endpoint.
//!
//! An [`Rpc`] multiplexes many sessions over one datapath transport and one
//! out-of-band SM socket. It is exclusively owned by the thread that
//! created it; all datapath work, timers, and SM processing run on that
//! thread inside the event loop. Background request handlers run on a
//! worker pool and talk back through bounded queues.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, trace, warn};

use crate::buffer::{MsgBuffer, PktBufPool};
use crate::config::RpcConfig;
use crate::dispatch::{
    BgChannels, BgPool, BgWork, Continuation, HandlerMode, ReqFuncRegistry, ReqHandle, RespondCtx,
};
use crate::error::{dp_fatal, Error, Result};
use crate::packet::{PktFlags, PktHdr, PktType, PKT_HDR_SIZE};
use crate::reliability::unacked_pkts;
use crate::session::{
    PeerInfo, SessionRole, SessionState, SessionTable, SlotState, INVALID_SESSION_NUM,
};
use crate::sm::{
    PendingSmReq, SmDedupVerdict, SmErr, SmEvent, SmEventHandler, SmEventKind, SmPkt, SmPktType,
    SmState,
};
use crate::timing::{current_time_us, TimerEntry, TimingWheel};
use crate::transport::{RouteInfo, Transport};

/// Client-side handle delivered to a continuation.
///
/// Hands the request and response buffers back to the user; a zero-size
/// response signals that the request failed (session error, peer reset, or
/// retransmission exhaustion). Pass the handle to
/// [`Rpc::release_response`] to return both buffers to the pool, or
/// destructure it to keep them.
pub struct RespHandle {
    /// Tag the request was enqueued with.
    pub tag: u64,
    /// The request buffer, returned to the caller.
    pub req_msgbuf: MsgBuffer,
    /// The response buffer; `data_size() == 0` means failure.
    pub resp_msgbuf: MsgBuffer,
}

/// Per-request state stored in the slot.
pub(crate) struct PendingRequest {
    cont: Continuation,
    tag: u64,
}

type Table = SessionTable<PendingRequest>;
type Slot = crate::session::SSlot<PendingRequest>;

/// A completed (or failed) request whose continuation is queued.
struct ContTask {
    session_num: u16,
    generation: u32,
    slot_idx: usize,
    cont: Continuation,
    tag: u64,
    req: MsgBuffer,
    resp: MsgBuffer,
}

/// An RPC endpoint.
pub struct Rpc {
    rpc_id: u8,
    config: RpcConfig,
    transport: RefCell<Box<dyn Transport>>,
    pool: Arc<PktBufPool>,
    sessions: RefCell<Table>,
    registry: Arc<ReqFuncRegistry>,
    sm: RefCell<SmState>,
    sm_handler: RefCell<Option<SmEventHandler>>,
    wheel: RefCell<TimingWheel>,
    cont_q: RefCell<VecDeque<ContTask>>,
    bg_channels: Option<Arc<BgChannels>>,
    _bg_pool: Option<BgPool>,
    #[cfg(feature = "fault-injection")]
    faults: RefCell<crate::fault::FaultState>,
    creator: ThreadId,
    ctx_depth: Cell<u32>,
    data_per_pkt: usize,
    rx_frame: RefCell<MsgBuffer>,
}

impl Rpc {
    /// Create an endpoint bound to `transport` for the datapath and
    /// `sm_bind_addr` (e.g. `"127.0.0.1:0"`) for the SM side channel.
    ///
    /// The calling thread becomes the endpoint's creator: only it may run
    /// the event loop and the control plane. The registry must already
    /// contain every request type this endpoint will serve.
    pub fn new(
        registry: Arc<ReqFuncRegistry>,
        transport: Box<dyn Transport>,
        sm_bind_addr: &str,
        rpc_id: u8,
        config: RpcConfig,
        sm_handler: Option<SmEventHandler>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.has_background() && config.num_bg_threads == 0 {
            return Err(Error::InvalidConfig(
                "registry has background handlers but num_bg_threads is 0",
            ));
        }

        let pool = Arc::new(PktBufPool::new(config.num_frames, transport.mtu())?);
        let data_per_pkt = pool.data_per_pkt();
        let rx_frame = pool.alloc_msg(data_per_pkt, true)?;

        let sm = SmState::bind(sm_bind_addr)?;

        let wheel = TimingWheel::for_rto_tracking(current_time_us());

        let (bg_channels, bg_pool) = if config.num_bg_threads > 0 {
            let channels = Arc::new(BgChannels::new(config.bg_queue_depth, config.max_msg_size));
            let pool_handle = BgPool::spawn(config.num_bg_threads, channels.clone(), pool.clone());
            (Some(channels), Some(pool_handle))
        } else {
            (None, None)
        };

        Ok(Self {
            rpc_id,
            transport: RefCell::new(transport),
            sessions: RefCell::new(Table::new(config.max_sessions)),
            registry,
            sm: RefCell::new(sm),
            sm_handler: RefCell::new(sm_handler),
            wheel: RefCell::new(wheel),
            cont_q: RefCell::new(VecDeque::new()),
            bg_channels,
            _bg_pool: bg_pool,
            #[cfg(feature = "fault-injection")]
            faults: RefCell::new(crate::fault::FaultState::default()),
            creator: thread::current().id(),
            ctx_depth: Cell::new(0),
            data_per_pkt,
            rx_frame: RefCell::new(rx_frame),
            pool,
            config,
        })
    }

    /// This endpoint's RPC id.
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    /// The endpoint configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Transport MTU in bytes.
    pub fn mtu(&self) -> usize {
        self.data_per_pkt + PKT_HDR_SIZE
    }

    /// The SM URI remote endpoints use in `create_session`.
    pub fn sm_uri(&self) -> String {
        self.sm.borrow().local_uri().to_string()
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.borrow().active_count()
    }

    /// State of a session, if it exists.
    pub fn session_state(&self, session_num: u16) -> Option<SessionState> {
        self.sessions.borrow().get(session_num).map(|s| s.state)
    }

    /// Number of free frames in the packet buffer pool.
    pub fn free_frames(&self) -> usize {
        self.pool.available()
    }

    #[inline]
    fn in_creator(&self) -> bool {
        thread::current().id() == self.creator
    }

    #[inline]
    fn in_callback(&self) -> bool {
        self.ctx_depth.get() > 0
    }

    fn check_ctrl_path(&self) -> Result<()> {
        if !self.in_creator() || self.in_callback() {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Message buffers
    // -------------------------------------------------------------------

    /// Allocate a message buffer able to hold `size` payload bytes.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        if size > self.config.max_msg_size {
            return Err(Error::MessageTooLarge {
                size,
                max: self.config.max_msg_size,
            });
        }
        self.pool.alloc_msg(size, false)
    }

    /// Return a message buffer to the pool.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        self.pool.free_msg(buf);
    }

    /// Release a continuation's handle, returning both buffers to the pool.
    pub fn release_response(&self, handle: RespHandle) {
        if !self.in_creator() {
            dp_fatal!("release_response from a non-creator thread");
            return;
        }
        self.pool.free_msg(handle.req_msgbuf);
        self.pool.free_msg(handle.resp_msgbuf);
    }

    // -------------------------------------------------------------------
    // Control plane
    // -------------------------------------------------------------------

    /// Create a client session to the endpoint at `remote_uri`
    /// (an SM URI, `"host:port"`) with the given RPC id.
    ///
    /// Returns the local session number. The session becomes usable once
    /// the SM handler reports [`SmEventKind::Connected`].
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<u16> {
        self.check_ctrl_path()?;

        let sm_addr: SocketAddr = remote_uri
            .to_socket_addrs()
            .map_err(|_| Error::InvalidArgument("unresolvable remote URI"))?
            .next()
            .ok_or(Error::InvalidArgument("unresolvable remote URI"))?;

        let peer = PeerInfo {
            hostname: remote_uri.to_string(),
            sm_addr,
            rpc_id: remote_rpc_id,
            dp_route: None,
            remote_session_num: INVALID_SESSION_NUM,
            remote_gen: 0,
        };

        let (session_num, generation) = {
            let mut sessions = self.sessions.borrow_mut();
            let session_num = sessions
                .create(SessionRole::Client, peer, self.config.req_window)
                .ok_or(Error::TooManySessions)?;
            let sess = sessions.get_mut(session_num).unwrap();
            sess.state = SessionState::ConnectInProgress;
            (session_num, sess.generation)
        };

        let now = current_time_us();
        let mut sm = self.sm.borrow_mut();
        let sm_req_num = sm.alloc_req_num();
        let pkt = SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErr::NoError,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: remote_rpc_id,
            src_session_num: session_num,
            dst_session_num: INVALID_SESSION_NUM,
            src_session_gen: generation,
            dst_session_gen: 0,
            sm_req_num,
            payload: 0,
            src_hostname: sm.local_uri().to_string(),
            dp_route: self.transport.borrow().local_route().to_string(),
        };

        // The stale-rinfo fault misdirects only the first transmission;
        // retries go to the real peer.
        #[cfg_attr(not(feature = "fault-injection"), allow(unused_mut))]
        let mut first_dest = sm_addr;
        #[cfg(feature = "fault-injection")]
        if self.faults.borrow_mut().take_resolve_server_rinfo() {
            // UDP discard: the attempt goes nowhere and the retry resolves
            // the real peer.
            first_dest.set_port(9);
            debug!("connect for session {} misdirected to {}", session_num, first_dest);
        }

        sm.send_request(
            pkt,
            first_dest,
            sm_addr,
            session_num,
            generation,
            now,
            self.config.sm_timeout_ms,
        );

        debug!("session {}: connecting to {} (rpc {})", session_num, remote_uri, remote_rpc_id);
        Ok(session_num)
    }

    /// Destroy a session.
    ///
    /// In-flight requests fail (continuation with a zero-size response).
    /// A connected session performs the disconnect handshake; a session
    /// already in the error state is removed immediately.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        self.check_ctrl_path()?;

        let state = {
            let sessions = self.sessions.borrow();
            let sess = sessions
                .get(session_num)
                .ok_or(Error::SessionNotFound(session_num))?;
            if !sess.is_client() {
                return Err(Error::InvalidArgument("only the session's client may destroy it"));
            }
            sess.state
        };

        match state {
            SessionState::Connected => {
                self.drain_slots_with_failure(session_num);

                let (generation, sm_addr, remote_session_num, remote_gen, dst_rpc_id) = {
                    let mut sessions = self.sessions.borrow_mut();
                    let sess = sessions.get_mut(session_num).unwrap();
                    sess.state = SessionState::DisconnectInProgress;
                    (
                        sess.generation,
                        sess.peer.sm_addr,
                        sess.peer.remote_session_num,
                        sess.peer.remote_gen,
                        sess.peer.rpc_id,
                    )
                };

                let now = current_time_us();
                let mut sm = self.sm.borrow_mut();
                let sm_req_num = sm.alloc_req_num();
                let pkt = SmPkt {
                    pkt_type: SmPktType::DisconnectReq,
                    err: SmErr::NoError,
                    src_rpc_id: self.rpc_id,
                    dst_rpc_id,
                    src_session_num: session_num,
                    dst_session_num: remote_session_num,
                    src_session_gen: generation,
                    dst_session_gen: remote_gen,
                    sm_req_num,
                    payload: 0,
                    src_hostname: sm.local_uri().to_string(),
                    dp_route: String::new(),
                };
                sm.send_request(
                    pkt,
                    sm_addr,
                    sm_addr,
                    session_num,
                    generation,
                    now,
                    self.config.sm_timeout_ms,
                );
                debug!("session {}: disconnecting", session_num);
                Ok(())
            }
            SessionState::Error => {
                self.drain_slots_with_failure(session_num);
                let mut sessions = self.sessions.borrow_mut();
                if let Some(mut sess) = sessions.remove(session_num) {
                    self.free_session_resources(&mut sess);
                }
                Ok(())
            }
            _ => Err(Error::InvalidArgument("session is not in a destroyable state")),
        }
    }

    // -------------------------------------------------------------------
    // Datapath: request submission
    // -------------------------------------------------------------------

    /// Enqueue a request on a connected session.
    ///
    /// `req` holds the request payload; `resp` must be large enough for
    /// the response. Both are borrowed by the runtime until `cont` fires
    /// with them (exactly once, success or failure). On a synchronous
    /// error both buffers are returned to the pool and no continuation
    /// runs.
    pub fn enqueue_request<F>(
        &self,
        session_num: u16,
        req_type: u8,
        req: MsgBuffer,
        resp: MsgBuffer,
        cont: F,
        tag: u64,
    ) -> Result<()>
    where
        F: FnOnce(&Rpc, RespHandle) + 'static,
    {
        match self.enqueue_request_inner(session_num, req_type, req, resp, Box::new(cont), tag) {
            Ok(()) => Ok(()),
            Err((e, req, resp, _cont)) => {
                self.pool.free_msg(req);
                self.pool.free_msg(resp);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn enqueue_request_inner(
        &self,
        session_num: u16,
        req_type: u8,
        req: MsgBuffer,
        resp: MsgBuffer,
        cont: Continuation,
        tag: u64,
    ) -> std::result::Result<(), (Error, MsgBuffer, MsgBuffer, Continuation)> {
        if !self.in_creator() {
            return Err((Error::PermissionDenied, req, resp, cont));
        }
        if req.data_size() == 0 {
            return Err((Error::InvalidArgument("empty request"), req, resp, cont));
        }
        if req.data_size() > self.config.max_msg_size {
            let e = Error::MessageTooLarge {
                size: req.data_size(),
                max: self.config.max_msg_size,
            };
            return Err((e, req, resp, cont));
        }

        let now = current_time_us();
        let (generation, slot_idx, req_num) = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(session_num) {
                Some(s) => s,
                None => return Err((Error::SessionNotFound(session_num), req, resp, cont)),
            };
            if !sess.is_connected() || !sess.is_client() {
                return Err((Error::SessionNotConnected(session_num), req, resp, cont));
            }
            let route = match sess.peer.dp_route {
                Some(r) => r,
                None => return Err((Error::SessionNotConnected(session_num), req, resp, cont)),
            };
            let slot_idx = match sess.find_free_slot() {
                Some(i) => i,
                None => return Err((Error::NoFreeSlots, req, resp, cont)),
            };

            let window = sess.req_window;
            let generation = sess.generation;
            let remote_sn = sess.peer.remote_session_num as u8;
            let num_pkts = req.num_pkts();
            let msg_size = req.data_size() as u32;

            let slot = &mut sess.slots[slot_idx];
            let req_num = slot.start_request(
                window,
                req_type,
                num_pkts,
                self.config.session_credits,
                PendingRequest { cont, tag },
                now,
            );
            slot.req_msgbuf = Some(req);
            slot.resp_msgbuf = Some(resp);

            // Initial burst, bounded by credits.
            let burst = (self.config.session_credits as u32).min(num_pkts);
            for pkt_num in 0..burst {
                let hdr = PktHdr::new(PktType::Req, remote_sn, req_type, msg_size, pkt_num, req_num);
                let bytes = slot.req_msgbuf.as_mut().unwrap().wire_pkt(pkt_num, &hdr);
                self.post_dp_pkt(&route, bytes);
                slot.tx_bitmap.set(pkt_num);
                slot.credits -= 1;
            }
            if slot.tx_bitmap.all_set() {
                slot.state = SlotState::WaitResponse;
            }

            (generation, slot_idx, req_num)
        };

        self.wheel.borrow_mut().insert(TimerEntry {
            session_num,
            generation,
            slot_idx,
            req_num,
            expires_at: now + self.config.rto_us,
        });

        trace!("session {}: request {} enqueued on slot {}", session_num, req_num, slot_idx);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Datapath: response submission (server side)
    // -------------------------------------------------------------------

    /// Transmit the response held in a request handle.
    ///
    /// Callable from the creator thread; background handlers go through
    /// their [`RespondCtx`], which funnels into this on the owner's next
    /// event-loop pass.
    pub fn enqueue_response(&self, mut handle: ReqHandle) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut_gen(handle.session_num, handle.generation) {
            Some(s) => s,
            None => {
                // Session died while the handler ran.
                drop(sessions);
                self.free_req_handle(handle);
                return;
            }
        };
        let remote_sn = sess.peer.remote_session_num as u8;
        let route = sess.peer.dp_route;
        let slot = &mut sess.slots[handle.slot_idx];

        if slot.state != SlotState::Responding || slot.server_req_num != handle.req_num {
            drop(sessions);
            self.free_req_handle(handle);
            return;
        }

        if let Some(req) = handle.req_msgbuf.take() {
            self.pool.free_msg(req);
        }

        let (resp, prealloc) = if handle.prealloc_used {
            if let Some(dynbuf) = handle.dyn_resp_msgbuf.take() {
                self.pool.free_msg(dynbuf);
            }
            (handle.pre_resp_msgbuf, true)
        } else {
            // Scratch goes back to the slot for the next request.
            slot.pre_resp_msgbuf = Some(handle.pre_resp_msgbuf);
            match handle.dyn_resp_msgbuf.take() {
                Some(dynbuf) => (dynbuf, false),
                None => {
                    dp_fatal!("enqueue_response without a response buffer");
                    return;
                }
            }
        };

        if resp.data_size() == 0 {
            dp_fatal!("enqueue_response with an empty response");
            if prealloc {
                slot.pre_resp_msgbuf = Some(resp);
            } else {
                self.pool.free_msg(resp);
            }
            return;
        }

        slot.tx_resp_msgbuf = Some(resp);
        slot.tx_resp_prealloc = prealloc;

        let resp = slot.tx_resp_msgbuf.as_mut().unwrap();
        let hdr = PktHdr::new(
            PktType::Resp,
            remote_sn,
            handle.req_type,
            resp.data_size() as u32,
            0,
            handle.req_num,
        );
        if let Some(route) = route {
            let bytes = resp.wire_pkt(0, &hdr);
            self.post_dp_pkt(&route, bytes);
        }
    }

    /// Free everything a request handle owns (stale-session path).
    fn free_req_handle(&self, mut handle: ReqHandle) {
        if let Some(req) = handle.req_msgbuf.take() {
            self.pool.free_msg(req);
        }
        if let Some(dynbuf) = handle.dyn_resp_msgbuf.take() {
            self.pool.free_msg(dynbuf);
        }
        self.pool.free_msg(handle.pre_resp_msgbuf);
    }

    // -------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------

    fn fault_check_ok(&self) {
        if cfg!(not(feature = "fault-injection")) {
            panic!("fault injection is disabled at compile time");
        }
        if !self.in_creator() {
            panic!("non-creator threads cannot inject faults");
        }
        if self.in_callback() {
            panic!("fault injection from a callback context");
        }
    }

    /// Drop the `countdown`-th next datapath transmission of this endpoint.
    pub fn fault_inject_drop_tx_local(&self, countdown: u64) {
        self.fault_check_ok();
        #[cfg(feature = "fault-injection")]
        {
            self.faults.borrow_mut().arm_drop_tx_local(countdown);
            debug!("fault: local TX drop armed, countdown {}", countdown);
        }
    }

    /// Ask the peer of `session_num` to drop its next `countdown`
    /// datapath transmissions.
    pub fn fault_inject_drop_tx_remote(&self, session_num: u16, countdown: u64) -> Result<()> {
        self.fault_check_ok();
        self.send_fault_sm(session_num, SmPktType::FaultDropTxRemote, countdown)
    }

    /// Force the peer of `session_num` to reset the session: its side
    /// transitions to the error state and drains in-flight requests.
    pub fn fault_inject_reset_remote_peer(&self, session_num: u16) -> Result<()> {
        self.fault_check_ok();
        self.send_fault_sm(session_num, SmPktType::FaultResetPeerReq, 0)
    }

    /// Make the next connect attempt carry wrong remote routing info.
    pub fn fault_inject_resolve_server_rinfo(&self) {
        self.fault_check_ok();
        #[cfg(feature = "fault-injection")]
        self.faults.borrow_mut().arm_resolve_server_rinfo();
    }

    fn send_fault_sm(&self, session_num: u16, pkt_type: SmPktType, payload: u64) -> Result<()> {
        let (sm_addr, remote_session_num, remote_gen, dst_rpc_id, generation) = {
            let sessions = self.sessions.borrow();
            let sess = sessions
                .get(session_num)
                .ok_or(Error::SessionNotFound(session_num))?;
            if !sess.is_connected() {
                return Err(Error::SessionNotConnected(session_num));
            }
            (
                sess.peer.sm_addr,
                sess.peer.remote_session_num,
                sess.peer.remote_gen,
                sess.peer.rpc_id,
                sess.generation,
            )
        };

        let mut sm = self.sm.borrow_mut();
        let sm_req_num = sm.alloc_req_num();
        let pkt = SmPkt {
            pkt_type,
            err: SmErr::NoError,
            src_rpc_id: self.rpc_id,
            dst_rpc_id,
            src_session_num: session_num,
            dst_session_num: remote_session_num,
            src_session_gen: generation,
            dst_session_gen: remote_gen,
            sm_req_num,
            payload,
            src_hostname: sm.local_uri().to_string(),
            dp_route: String::new(),
        };
        debug!("fault: sending {:?} for session {}", pkt_type, session_num);
        sm.send(&pkt, sm_addr)
    }

    // -------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------

    /// Run the event loop for roughly `ms` milliseconds.
    pub fn run_event_loop(&self, ms: u64) {
        let start = std::time::Instant::now();
        let duration = std::time::Duration::from_millis(ms);
        loop {
            self.run_event_loop_once();
            if start.elapsed() >= duration {
                break;
            }
            std::hint::spin_loop();
        }
    }

    /// Run a single event-loop pass.
    pub fn run_event_loop_once(&self) {
        if !self.in_creator() {
            dp_fatal!("event loop run from a non-creator thread");
            return;
        }
        if self.in_callback() {
            dp_fatal!("event loop run reentrantly from a callback");
            return;
        }

        // 1. Datapath RX.
        for _ in 0..self.config.rx_batch {
            match self.poll_transport() {
                Some((hdr, payload, src)) => self.process_dp_pkt(hdr, &payload, src),
                None => break,
            }
        }

        // 2. SM RX.
        loop {
            let polled = self.sm.borrow_mut().poll();
            match polled {
                Some((pkt, src)) => self.process_sm_pkt(pkt, src),
                None => break,
            }
        }

        // 3. Requests and responses produced by background handlers.
        if let Some(channels) = &self.bg_channels {
            while let Some(d) = channels.deferred.pop() {
                let cont: Continuation = d.cont;
                if let Err((e, req, mut resp, cont)) =
                    self.enqueue_request_inner(d.session_num, d.req_type, d.req, d.resp, cont, d.tag)
                {
                    warn!("deferred request on session {} failed: {}", d.session_num, e);
                    resp.resize(0);
                    self.run_continuation(cont, d.tag, req, resp);
                }
            }
            while let Some(handle) = channels.done.pop() {
                self.enqueue_response(handle);
            }
        }

        // 4. Continuations, bounded per pass for RX forward progress.
        self.run_continuations(self.config.cont_batch);

        // 5. Timers.
        let now = current_time_us();
        self.advance_sm_timer(now);
        self.advance_dp_timer(now);

        // 6. TX flush.
        if let Err(e) = self.transport.borrow_mut().tx_flush() {
            warn!("tx_flush failed: {}", e);
        }
    }

    fn poll_transport(&self) -> Option<(PktHdr, Vec<u8>, RouteInfo)> {
        let mut staging = self.rx_frame.borrow_mut();
        let buf = staging.frame_bytes_mut(0);
        let polled = self.transport.borrow_mut().poll_rx(buf);
        let (len, src) = match polled {
            Ok(Some(r)) => r,
            Ok(None) => return None,
            Err(e) => {
                warn!("transport poll_rx failed: {}", e);
                return None;
            }
        };
        if len < PKT_HDR_SIZE {
            warn!("runt packet ({} bytes) from {}", len, src);
            return None;
        }
        let hdr = match PktHdr::read_from(&buf[..len]) {
            Ok(h) => h,
            Err(e) => {
                warn!("malformed packet from {}: {}", src, e);
                return None;
            }
        };
        Some((hdr, buf[PKT_HDR_SIZE..len].to_vec(), src))
    }

    fn run_continuation(&self, cont: Continuation, tag: u64, req: MsgBuffer, resp: MsgBuffer) {
        let depth = self.ctx_depth.get();
        self.ctx_depth.set(depth + 1);
        cont(
            self,
            RespHandle {
                tag,
                req_msgbuf: req,
                resp_msgbuf: resp,
            },
        );
        self.ctx_depth.set(depth);
    }

    fn run_continuations(&self, max: usize) {
        for _ in 0..max {
            let task = match self.cont_q.borrow_mut().pop_front() {
                Some(t) => t,
                None => break,
            };
            {
                let mut sessions = self.sessions.borrow_mut();
                if let Some(sess) = sessions.get_mut_gen(task.session_num, task.generation) {
                    let slot = &mut sess.slots[task.slot_idx];
                    if slot.state == SlotState::Complete {
                        slot.reset_client();
                    }
                }
            }
            self.run_continuation(task.cont, task.tag, task.req, task.resp);
        }
    }

    // -------------------------------------------------------------------
    // Datapath RX
    // -------------------------------------------------------------------

    fn process_dp_pkt(&self, hdr: PktHdr, payload: &[u8], src: RouteInfo) {
        match hdr.pkt_type {
            PktType::Req => self.handle_req_pkt(&hdr, payload, src),
            PktType::Resp => self.handle_resp_pkt(&hdr, payload),
            PktType::Ecr => self.handle_ecr_pkt(&hdr),
            PktType::Rfr => self.handle_rfr_pkt(&hdr),
            PktType::Sm => warn!("SM-typed packet on the datapath socket; dropped"),
        }
    }

    fn handle_req_pkt(&self, hdr: &PktHdr, payload: &[u8], src: RouteInfo) {
        let dispatch = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut(hdr.dest_session_num as u16) {
                Some(s) => s,
                None => {
                    dp_fatal!("request for nonexistent session {} from {}", hdr.dest_session_num, src);
                    return;
                }
            };
            if sess.is_client() {
                dp_fatal!("request packet on a client session {}", sess.local_session_num);
                return;
            }
            if sess.state != SessionState::Connected {
                return;
            }

            let session_num = sess.local_session_num;
            let generation = sess.generation;
            let window = sess.req_window as u32;
            let remote_sn = sess.peer.remote_session_num as u8;
            let route = match sess.peer.dp_route {
                Some(r) => r,
                None => return,
            };
            let slot_idx = sess.slot_for_req(hdr.req_num);
            let slot = &mut sess.slots[slot_idx];

            if hdr.req_num == slot.server_req_num.wrapping_add(window) {
                // The client reused the slot, which proves it saw the whole
                // previous response. Retire it and accept the new request.
                match slot.state {
                    SlotState::Responding | SlotState::Free => {
                        self.retire_server_slot(slot);
                        slot.server_req_num = hdr.req_num;
                        slot.state = SlotState::Free;
                    }
                    _ => {
                        dp_fatal!(
                            "session {}: slot {} reused while request {} is incomplete",
                            session_num,
                            slot_idx,
                            slot.server_req_num
                        );
                        return;
                    }
                }
            } else if hdr.req_num != slot.server_req_num {
                if hdr.req_num < slot.server_req_num {
                    trace!("session {}: stale request packet {}", session_num, hdr.req_num);
                } else {
                    dp_fatal!(
                        "session {}: request number {} jumps past expected {}",
                        session_num,
                        hdr.req_num,
                        slot.server_req_num
                    );
                }
                return;
            }

            match slot.state {
                SlotState::Free => {
                    // First packet of a new request.
                    let msg_size = hdr.msg_size as usize;
                    if msg_size == 0 || msg_size > self.config.max_msg_size {
                        dp_fatal!("session {}: request with bad msg_size {}", session_num, msg_size);
                        return;
                    }
                    let num_pkts = PktHdr::calc_num_pkts(msg_size, self.data_per_pkt);
                    if hdr.pkt_num >= num_pkts {
                        dp_fatal!("session {}: pkt_num {} out of range", session_num, hdr.pkt_num);
                        return;
                    }
                    let mut rx = match self.pool.alloc_msg(msg_size, false) {
                        Ok(b) => b,
                        Err(_) => {
                            // Dropping the packet is safe; the client
                            // retransmits after its RTO.
                            warn!("session {}: out of buffers for inbound request", session_num);
                            return;
                        }
                    };
                    slot.rx_bitmap.reset(num_pkts);
                    if !self.write_rx_chunk(&mut rx, hdr.pkt_num, payload) {
                        self.pool.free_msg(rx);
                        return;
                    }
                    slot.rx_bitmap.set(hdr.pkt_num);
                    slot.rx_msgbuf = Some(rx);
                    slot.state = SlotState::RxRequest;
                    slot.req_type = hdr.req_type;

                    if hdr.pkt_num + 1 != num_pkts {
                        self.post_ecr(&route, remote_sn, hdr);
                    }
                    self.finish_request_if_complete(sess, slot_idx, session_num, generation)
                }
                SlotState::RxRequest => {
                    let num_pkts = sess.slots[slot_idx].rx_bitmap.len();
                    if hdr.pkt_num >= num_pkts {
                        dp_fatal!("session {}: pkt_num {} out of range", session_num, hdr.pkt_num);
                        return;
                    }
                    let slot = &mut sess.slots[slot_idx];
                    let newly = slot.rx_bitmap.set(hdr.pkt_num);
                    if newly {
                        let mut rx = slot.rx_msgbuf.take().unwrap();
                        if !self.write_rx_chunk(&mut rx, hdr.pkt_num, payload) {
                            slot.rx_msgbuf = Some(rx);
                            return;
                        }
                        slot.rx_msgbuf = Some(rx);
                    }
                    // Re-ack duplicates too: a duplicate means our ECR was
                    // likely lost.
                    if hdr.pkt_num + 1 != num_pkts {
                        self.post_ecr(&route, remote_sn, hdr);
                    }
                    if newly {
                        self.finish_request_if_complete(sess, slot_idx, session_num, generation)
                    } else {
                        None
                    }
                }
                SlotState::Responding => {
                    // Duplicate of a request we already answered (or are
                    // answering): re-send the first response packet.
                    let slot = &mut sess.slots[slot_idx];
                    if let Some(resp) = slot.tx_resp_msgbuf.as_mut() {
                        let resp_hdr = PktHdr::new(
                            PktType::Resp,
                            remote_sn,
                            slot.req_type,
                            resp.data_size() as u32,
                            0,
                            hdr.req_num,
                        );
                        let bytes = resp.wire_pkt(0, &resp_hdr);
                        self.post_dp_pkt(&route, bytes);
                    }
                    None
                }
                _ => None,
            }
        };

        if let Some((handle, handler, mode)) = dispatch {
            self.dispatch_request(handle, handler, mode);
        }
    }

    /// If the request in `slot_idx` is fully reassembled, claim it for
    /// dispatch. Returns the handle and handler to invoke after the
    /// session borrow is released.
    #[allow(clippy::type_complexity)]
    fn finish_request_if_complete(
        &self,
        sess: &mut crate::session::Session<PendingRequest>,
        slot_idx: usize,
        session_num: u16,
        generation: u32,
    ) -> Option<(ReqHandle, crate::dispatch::ReqHandlerFn, HandlerMode)> {
        let slot = &mut sess.slots[slot_idx];
        if !slot.rx_bitmap.all_set() {
            return None;
        }

        let req = slot.rx_msgbuf.take().unwrap();
        let pre_resp = match slot.pre_resp_msgbuf.take() {
            Some(b) => b,
            None => {
                dp_fatal!("session {}: server slot without response scratch", session_num);
                slot.rx_msgbuf = Some(req);
                return None;
            }
        };
        slot.state = SlotState::Responding;

        let req_type = slot.req_type;
        let req_num = slot.server_req_num;

        let func = match self.registry.get(req_type) {
            Some(f) => f,
            None => {
                dp_fatal!("no handler registered for request type {}", req_type);
                self.pool.free_msg(req);
                sess.slots[slot_idx].pre_resp_msgbuf = Some(pre_resp);
                sess.slots[slot_idx].state = SlotState::Free;
                return None;
            }
        };

        let handle = ReqHandle {
            session_num,
            generation,
            slot_idx,
            req_num,
            req_type,
            req_msgbuf: Some(req),
            pre_resp_msgbuf: pre_resp,
            dyn_resp_msgbuf: None,
            prealloc_used: true,
        };
        Some((handle, func.handler.clone(), func.mode))
    }

    fn dispatch_request(
        &self,
        handle: ReqHandle,
        handler: crate::dispatch::ReqHandlerFn,
        mode: HandlerMode,
    ) {
        match mode {
            HandlerMode::Foreground => {
                let depth = self.ctx_depth.get();
                self.ctx_depth.set(depth + 1);
                handler(handle, &RespondCtx::foreground(self));
                self.ctx_depth.set(depth);
            }
            HandlerMode::Background => {
                let channels = self.bg_channels.as_ref().expect("background pool not running");
                if let Err(work) = channels.work.push(BgWork { handler, handle }) {
                    // Queue full; degrade to inline execution rather than
                    // dropping the request.
                    warn!("background queue full; running handler inline");
                    let depth = self.ctx_depth.get();
                    self.ctx_depth.set(depth + 1);
                    (work.handler)(work.handle, &RespondCtx::foreground(self));
                    self.ctx_depth.set(depth);
                }
            }
        }
    }

    /// Free the response resources of a served request when the client
    /// reuses the slot.
    fn retire_server_slot(&self, slot: &mut Slot) {
        if let Some(resp) = slot.tx_resp_msgbuf.take() {
            if slot.tx_resp_prealloc {
                let mut resp = resp;
                resp.resize(resp.max_data_size());
                slot.pre_resp_msgbuf = Some(resp);
            } else {
                self.pool.free_msg(resp);
            }
        }
        if let Some(rx) = slot.rx_msgbuf.take() {
            self.pool.free_msg(rx);
        }
    }

    fn handle_resp_pkt(&self, hdr: &PktHdr, payload: &[u8]) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(hdr.dest_session_num as u16) {
            Some(s) => s,
            None => {
                dp_fatal!("response for nonexistent session {}", hdr.dest_session_num);
                return;
            }
        };
        if !sess.is_client() {
            dp_fatal!("response packet on a server session {}", sess.local_session_num);
            return;
        }

        let session_num = sess.local_session_num;
        let generation = sess.generation;
        let credits_limit = self.config.session_credits as u32;
        let remote_sn = sess.peer.remote_session_num as u8;
        let route = sess.peer.dp_route;
        let slot_idx = sess.slot_for_req(hdr.req_num);
        let slot = &mut sess.slots[slot_idx];

        if slot.is_free() || slot.state == SlotState::Complete || slot.cur_req_num != hdr.req_num {
            if !slot.is_free() && hdr.req_num > slot.cur_req_num {
                dp_fatal!(
                    "session {}: response for future request {} (current {})",
                    session_num,
                    hdr.req_num,
                    slot.cur_req_num
                );
            }
            return;
        }

        let now = current_time_us();

        if slot.resp_num_pkts == 0 {
            // First response fragment: the request is implicitly acked and
            // the response geometry becomes known.
            let msg_size = hdr.msg_size as usize;
            let num_pkts = PktHdr::calc_num_pkts(msg_size, self.data_per_pkt).max(1);
            let resp = slot.resp_msgbuf.as_mut().unwrap();
            if msg_size > resp.max_data_size() {
                warn!(
                    "session {}: response of {} bytes exceeds the caller's {}-byte buffer",
                    session_num,
                    msg_size,
                    resp.max_data_size()
                );
                self.fail_slot(sess, slot_idx);
                return;
            }
            resp.resize(msg_size);
            slot.resp_num_pkts = num_pkts;
            slot.resp_rx_bitmap.reset(num_pkts);
            slot.ack_bitmap.set_all();
            slot.state = SlotState::RxResponse;
        }

        if hdr.pkt_num >= slot.resp_num_pkts {
            dp_fatal!("session {}: response pkt_num {} out of range", session_num, hdr.pkt_num);
            return;
        }
        if !slot.resp_rx_bitmap.set(hdr.pkt_num) {
            return;
        }
        if !self.write_rx_chunk(slot.resp_msgbuf.as_mut().unwrap(), hdr.pkt_num, payload) {
            return;
        }
        slot.last_event_us = now;
        slot.retries = 0;

        // Pull further fragments, keeping at most `credits_limit` RFRs
        // outstanding.
        if slot.resp_num_pkts > 1 {
            let received = slot.resp_rx_bitmap.count_set();
            if let Some(route) = route {
                while slot.rfr_next < slot.resp_num_pkts
                    && slot.rfr_next.saturating_sub(received) < credits_limit
                {
                    let rfr = PktHdr::new(
                        PktType::Rfr,
                        remote_sn,
                        slot.req_type,
                        hdr.msg_size,
                        slot.rfr_next,
                        hdr.req_num,
                    );
                    self.post_ctrl_pkt(&route, &rfr);
                    slot.rfr_next += 1;
                }
            }
        }

        if slot.resp_rx_bitmap.all_set() {
            let pending = slot.user_data.take().unwrap();
            let req = slot.req_msgbuf.take().unwrap();
            let resp = slot.resp_msgbuf.take().unwrap();
            slot.state = SlotState::Complete;
            trace!("session {}: request {} complete", session_num, hdr.req_num);
            self.cont_q.borrow_mut().push_back(ContTask {
                session_num,
                generation,
                slot_idx,
                cont: pending.cont,
                tag: pending.tag,
                req,
                resp,
            });
        }
    }

    fn handle_ecr_pkt(&self, hdr: &PktHdr) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(hdr.dest_session_num as u16) {
            Some(s) => s,
            None => return,
        };
        if !sess.is_client() {
            return;
        }
        let remote_sn = sess.peer.remote_session_num as u8;
        let route = sess.peer.dp_route;
        let slot_idx = sess.slot_for_req(hdr.req_num);
        let slot = &mut sess.slots[slot_idx];

        if slot.is_free() || slot.cur_req_num != hdr.req_num {
            return;
        }
        if hdr.pkt_num >= slot.ack_bitmap.len() || !slot.ack_bitmap.set(hdr.pkt_num) {
            return;
        }

        slot.credits += 1;
        slot.last_event_us = current_time_us();
        slot.retries = 0;

        // Credit-clocked transmission of the remaining request fragments.
        if let Some(route) = route {
            let msg_size = slot.req_msgbuf.as_ref().unwrap().data_size() as u32;
            let to_send: Vec<u32> = slot.tx_bitmap.iter_clear().take(slot.credits).collect();
            for pkt_num in to_send {
                let pkt_hdr = PktHdr::new(
                    PktType::Req,
                    remote_sn,
                    slot.req_type,
                    msg_size,
                    pkt_num,
                    hdr.req_num,
                );
                let bytes = slot.req_msgbuf.as_mut().unwrap().wire_pkt(pkt_num, &pkt_hdr);
                self.post_dp_pkt(&route, bytes);
                slot.tx_bitmap.set(pkt_num);
                slot.credits -= 1;
            }
        }
        if slot.state == SlotState::TxRequest && slot.tx_bitmap.all_set() {
            slot.state = SlotState::WaitResponse;
        }
    }

    fn handle_rfr_pkt(&self, hdr: &PktHdr) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(hdr.dest_session_num as u16) {
            Some(s) => s,
            None => return,
        };
        if sess.is_client() {
            return;
        }
        let remote_sn = sess.peer.remote_session_num as u8;
        let route = match sess.peer.dp_route {
            Some(r) => r,
            None => return,
        };
        let slot_idx = sess.slot_for_req(hdr.req_num);
        let slot = &mut sess.slots[slot_idx];

        if slot.state != SlotState::Responding || slot.server_req_num != hdr.req_num {
            return;
        }
        let resp = match slot.tx_resp_msgbuf.as_mut() {
            Some(r) => r,
            None => return,
        };
        if hdr.pkt_num >= resp.num_pkts() {
            return;
        }
        let resp_hdr = PktHdr::new(
            PktType::Resp,
            remote_sn,
            slot.req_type,
            resp.data_size() as u32,
            hdr.pkt_num,
            hdr.req_num,
        );
        let bytes = resp.wire_pkt(hdr.pkt_num, &resp_hdr);
        self.post_dp_pkt(&route, bytes);
    }

    /// Copy a received fragment into its place in `buf`. Returns false if
    /// the chunk length does not match the message geometry.
    fn write_rx_chunk(&self, buf: &mut MsgBuffer, pkt_num: u32, payload: &[u8]) -> bool {
        let start = pkt_num as usize * self.data_per_pkt;
        let expect = (buf.data_size() - start).min(self.data_per_pkt);
        if payload.len() != expect {
            warn!("fragment {} has {} bytes, expected {}", pkt_num, payload.len(), expect);
            return false;
        }
        buf.write_chunk(pkt_num, payload);
        true
    }

    /// Fail the in-flight request in `slot_idx`: queue its continuation
    /// with a zero-size response.
    fn fail_slot(&self, sess: &mut crate::session::Session<PendingRequest>, slot_idx: usize) {
        let session_num = sess.local_session_num;
        let generation = sess.generation;
        let slot = &mut sess.slots[slot_idx];
        debug_assert!(!slot.is_free() && slot.state != SlotState::Complete);

        let pending = slot.user_data.take().unwrap();
        let req = slot.req_msgbuf.take().unwrap();
        let mut resp = slot.resp_msgbuf.take().unwrap();
        resp.resize(0);
        slot.state = SlotState::Complete;

        self.cont_q.borrow_mut().push_back(ContTask {
            session_num,
            generation,
            slot_idx,
            cont: pending.cont,
            tag: pending.tag,
            req,
            resp,
        });
    }

    // -------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------

    fn advance_dp_timer(&self, now: u64) {
        let expired = self.wheel.borrow_mut().advance(now);
        for entry in expired {
            self.handle_dp_timeout(entry, now);
        }
    }

    fn handle_dp_timeout(&self, entry: TimerEntry, now: u64) {
        let mut failed_session = None;
        {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut_gen(entry.session_num, entry.generation) {
                Some(s) => s,
                None => return,
            };
            let credits_limit = self.config.session_credits;
            let remote_sn = sess.peer.remote_session_num as u8;
            let route = sess.peer.dp_route;
            let slot = &mut sess.slots[entry.slot_idx];

            if slot.is_free() || slot.state == SlotState::Complete || slot.cur_req_num != entry.req_num
            {
                return;
            }

            // Deadline is lazily re-armed if there was progress since.
            if now.saturating_sub(slot.last_event_us) < self.config.rto_us {
                self.wheel.borrow_mut().insert(TimerEntry {
                    expires_at: slot.last_event_us + self.config.rto_us,
                    ..entry
                });
                return;
            }

            slot.retries += 1;
            if slot.retries > self.config.max_retries {
                warn!(
                    "session {}: request {} exhausted {} retries",
                    entry.session_num, entry.req_num, self.config.max_retries
                );
                failed_session = Some(entry.session_num);
            } else if let Some(route) = route {
                let req_num = entry.req_num;
                let req_type = slot.req_type;
                if slot.resp_num_pkts > 0 {
                    // Response phase: re-pull the missing fragments.
                    let msg_size = slot.resp_msgbuf.as_ref().unwrap().data_size() as u32;
                    let missing: Vec<u32> =
                        slot.resp_rx_bitmap.iter_clear().take(credits_limit).collect();
                    for pkt_num in missing {
                        let mut rfr =
                            PktHdr::new(PktType::Rfr, remote_sn, req_type, msg_size, pkt_num, req_num);
                        rfr.flags |= PktFlags::RETRANSMIT;
                        self.post_ctrl_pkt(&route, &rfr);
                    }
                } else {
                    let msg_size = slot.req_msgbuf.as_ref().unwrap().data_size() as u32;
                    let lost = unacked_pkts(&slot.tx_bitmap, &slot.ack_bitmap);
                    if lost.is_empty() {
                        // Everything we sent was acked but no response
                        // appeared: poke the server with the last fragment.
                        let last = slot.tx_bitmap.len() - 1;
                        let mut hdr = PktHdr::new(
                            PktType::Req, remote_sn, req_type, msg_size, last, req_num,
                        );
                        hdr.flags |= PktFlags::RETRANSMIT;
                        let bytes = slot.req_msgbuf.as_mut().unwrap().wire_pkt(last, &hdr);
                        self.post_dp_pkt(&route, bytes);
                    } else {
                        debug!(
                            "session {}: request {} retransmitting {} fragment(s)",
                            entry.session_num,
                            req_num,
                            lost.len()
                        );
                        for pkt_num in lost {
                            let mut hdr = PktHdr::new(
                                PktType::Req, remote_sn, req_type, msg_size, pkt_num, req_num,
                            );
                            hdr.flags |= PktFlags::RETRANSMIT;
                            let bytes = slot.req_msgbuf.as_mut().unwrap().wire_pkt(pkt_num, &hdr);
                            self.post_dp_pkt(&route, bytes);
                        }
                    }
                }
                slot.last_event_us = now;
                self.wheel.borrow_mut().insert(TimerEntry {
                    expires_at: now + self.config.rto_us,
                    ..entry
                });
            }
        }

        if let Some(session_num) = failed_session {
            self.session_error(session_num, SmEventKind::SessionError);
        }
    }

    fn advance_sm_timer(&self, now: u64) {
        let mut exhausted: Vec<PendingSmReq> = Vec::new();
        {
            let mut sm = self.sm.borrow_mut();
            let timeout_us = self.config.sm_timeout_ms * 1000;
            let max_retries = self.config.sm_max_retries;
            let mut i = 0;
            while i < sm.pending.len() {
                if now >= sm.pending[i].next_retry_us {
                    if sm.pending[i].retries >= max_retries {
                        exhausted.push(sm.pending.swap_remove(i));
                        continue;
                    }
                    sm.pending[i].retries += 1;
                    sm.pending[i].next_retry_us = now + timeout_us;
                    let pkt = sm.pending[i].pkt.clone();
                    let dest = sm.pending[i].dest;
                    debug!("SM retry {} of {:?}", sm.pending[i].retries, pkt.pkt_type);
                    if let Err(e) = sm.send(&pkt, dest) {
                        warn!("SM retransmit failed: {}", e);
                    }
                }
                i += 1;
            }
        }

        for p in exhausted {
            match p.pkt.pkt_type {
                SmPktType::ConnectReq => {
                    warn!("session {}: connect timed out", p.session_num);
                    let mut sessions = self.sessions.borrow_mut();
                    if let Some(sess) = sessions.get_mut_gen(p.session_num, p.generation) {
                        if sess.state == SessionState::ConnectInProgress {
                            sess.state = SessionState::Error;
                        }
                    }
                    drop(sessions);
                    self.fire_sm_event(SmEvent {
                        session_num: p.session_num,
                        kind: SmEventKind::ConnectFailed,
                    });
                }
                SmPktType::DisconnectReq => {
                    // The peer is gone; finish teardown locally.
                    let mut sessions = self.sessions.borrow_mut();
                    if let Some(mut sess) = sessions.remove(p.session_num) {
                        self.free_session_resources(&mut sess);
                    }
                    drop(sessions);
                    self.fire_sm_event(SmEvent {
                        session_num: p.session_num,
                        kind: SmEventKind::Disconnected,
                    });
                }
                _ => {}
            }
        }
    }

    // -------------------------------------------------------------------
    // Session failure paths
    // -------------------------------------------------------------------

    /// Queue a failure continuation for every in-flight client request on
    /// the session, in slot-index order.
    fn drain_slots_with_failure(&self, session_num: u16) {
        let mut sessions = self.sessions.borrow_mut();
        let sess = match sessions.get_mut(session_num) {
            Some(s) => s,
            None => return,
        };
        for slot_idx in 0..sess.slots.len() {
            let state = sess.slots[slot_idx].state;
            match state {
                SlotState::TxRequest | SlotState::WaitResponse | SlotState::RxResponse => {
                    self.fail_slot(sess, slot_idx);
                }
                _ => {}
            }
        }
    }

    /// Transition a session to the error state, failing all in-flight
    /// requests and notifying the SM handler.
    fn session_error(&self, session_num: u16, kind: SmEventKind) {
        {
            let sessions = self.sessions.borrow();
            match sessions.get(session_num) {
                Some(s) if s.state != SessionState::Error => {}
                _ => return,
            }
        }
        self.drain_slots_with_failure(session_num);
        {
            let mut sessions = self.sessions.borrow_mut();
            if let Some(sess) = sessions.get_mut(session_num) {
                sess.state = SessionState::Error;
                for slot_idx in 0..sess.slots.len() {
                    let slot = &mut sess.slots[slot_idx];
                    self.retire_server_slot(slot);
                }
            }
        }
        self.fire_sm_event(SmEvent { session_num, kind });
    }

    fn free_session_resources(&self, sess: &mut crate::session::Session<PendingRequest>) {
        for slot in &mut sess.slots {
            self.retire_server_slot(slot);
            if let Some(b) = slot.pre_resp_msgbuf.take() {
                self.pool.free_msg(b);
            }
            if let Some(b) = slot.req_msgbuf.take() {
                self.pool.free_msg(b);
            }
            if let Some(b) = slot.resp_msgbuf.take() {
                self.pool.free_msg(b);
            }
        }
    }

    fn fire_sm_event(&self, event: SmEvent) {
        let mut handler = self.sm_handler.borrow_mut();
        if let Some(h) = handler.as_mut() {
            let depth = self.ctx_depth.get();
            self.ctx_depth.set(depth + 1);
            h(event);
            self.ctx_depth.set(depth);
        }
    }

    // -------------------------------------------------------------------
    // SM RX
    // -------------------------------------------------------------------

    fn process_sm_pkt(&self, pkt: SmPkt, src: SocketAddr) {
        if pkt.dst_rpc_id != self.rpc_id {
            warn!("SM packet for rpc {} on rpc {}; dropped", pkt.dst_rpc_id, self.rpc_id);
            return;
        }
        trace!("SM rx {:?} from {}", pkt.pkt_type, src);

        if pkt.pkt_type.is_request() {
            let verdict = self.sm.borrow_mut().dedup_check(&pkt, src);
            if verdict != SmDedupVerdict::New {
                return;
            }
        }

        match pkt.pkt_type {
            SmPktType::ConnectReq => self.handle_connect_req(pkt, src),
            SmPktType::ConnectResp => self.handle_connect_resp(pkt),
            SmPktType::DisconnectReq => self.handle_disconnect_req(pkt, src),
            SmPktType::DisconnectResp => self.handle_disconnect_resp(pkt),
            SmPktType::FaultResetPeerReq => {
                self.sm.borrow_mut().record_processed(&pkt, src, None);
                self.handle_reset_peer(pkt);
            }
            SmPktType::FaultDropTxRemote => {
                self.sm.borrow_mut().record_processed(&pkt, src, None);
                self.handle_drop_tx_remote(pkt);
            }
        }
    }

    fn handle_connect_req(&self, pkt: SmPkt, src: SocketAddr) {
        let dp_route = pkt.dp_route.parse::<SocketAddr>().ok().map(RouteInfo::new);

        let mut resp = SmPkt {
            pkt_type: SmPktType::ConnectResp,
            err: SmErr::NoError,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: pkt.src_rpc_id,
            src_session_num: INVALID_SESSION_NUM,
            dst_session_num: pkt.src_session_num,
            src_session_gen: 0,
            dst_session_gen: pkt.src_session_gen,
            sm_req_num: pkt.sm_req_num,
            payload: 0,
            src_hostname: self.sm.borrow().local_uri().to_string(),
            dp_route: self.transport.borrow().local_route().to_string(),
        };

        let accepted = match dp_route {
            None => {
                resp.err = SmErr::InvalidRemote;
                false
            }
            Some(route) => {
                let mut sessions = self.sessions.borrow_mut();
                let peer = PeerInfo {
                    hostname: pkt.src_hostname.clone(),
                    sm_addr: src,
                    rpc_id: pkt.src_rpc_id,
                    dp_route: Some(route),
                    remote_session_num: pkt.src_session_num,
                    remote_gen: pkt.src_session_gen,
                };
                match sessions.create(SessionRole::Server, peer, self.config.req_window) {
                    None => {
                        resp.err = SmErr::NoSessionAvailable;
                        false
                    }
                    Some(session_num) => {
                        let sess = sessions.get_mut(session_num).unwrap();
                        sess.state = SessionState::Connected;

                        // Preallocate the per-slot response scratch.
                        let mut ok = true;
                        for slot in &mut sess.slots {
                            match self.pool.alloc_msg(self.data_per_pkt, true) {
                                Ok(b) => slot.pre_resp_msgbuf = Some(b),
                                Err(_) => {
                                    ok = false;
                                    break;
                                }
                            }
                        }
                        if !ok {
                            let mut sess = sessions.remove(session_num).unwrap();
                            self.free_session_resources(&mut sess);
                            resp.err = SmErr::NoSessionAvailable;
                            false
                        } else {
                            resp.src_session_num = session_num;
                            resp.src_session_gen = sess.generation;
                            debug!(
                                "session {}: accepted connect from {} (rpc {})",
                                session_num, pkt.src_hostname, pkt.src_rpc_id
                            );
                            true
                        }
                    }
                }
            }
        };
        if !accepted {
            debug!("connect from {} refused: {:?}", pkt.src_hostname, resp.err);
        }

        let mut sm = self.sm.borrow_mut();
        if let Err(e) = sm.send(&resp, src) {
            warn!("SM response send failed: {}", e);
        }
        sm.record_processed(&pkt, src, Some(resp));
    }

    fn handle_connect_resp(&self, pkt: SmPkt) {
        let pending = match self.sm.borrow_mut().take_pending(pkt.sm_req_num) {
            Some(p) => p,
            None => return, // duplicate or unsolicited response
        };

        let event = {
            let mut sessions = self.sessions.borrow_mut();
            let sess = match sessions.get_mut_gen(pending.session_num, pending.generation) {
                Some(s) => s,
                None => return,
            };
            if sess.state != SessionState::ConnectInProgress {
                return;
            }
            if pkt.err == SmErr::NoError {
                sess.state = SessionState::Connected;
                sess.peer.remote_session_num = pkt.src_session_num;
                sess.peer.remote_gen = pkt.src_session_gen;
                sess.peer.dp_route = pkt.dp_route.parse::<SocketAddr>().ok().map(RouteInfo::new);
                if sess.peer.dp_route.is_none() {
                    sess.state = SessionState::Error;
                    SmEventKind::ConnectFailed
                } else {
                    debug!("session {}: connected", pending.session_num);
                    SmEventKind::Connected
                }
            } else {
                warn!("session {}: connect refused: {:?}", pending.session_num, pkt.err);
                sess.state = SessionState::Error;
                SmEventKind::ConnectFailed
            }
        };

        self.fire_sm_event(SmEvent {
            session_num: pending.session_num,
            kind: event,
        });
    }

    fn handle_disconnect_req(&self, pkt: SmPkt, src: SocketAddr) {
        {
            let mut sessions = self.sessions.borrow_mut();
            let matches = sessions
                .get(pkt.dst_session_num)
                .map(|s| !s.is_client() && s.generation == pkt.dst_session_gen)
                .unwrap_or(false);
            if matches {
                let mut sess = sessions.remove(pkt.dst_session_num).unwrap();
                self.free_session_resources(&mut sess);
                debug!("session {}: removed on peer disconnect", pkt.dst_session_num);
            }
            // A missing session is fine: the response was lost and the
            // teardown already happened.
        }

        let resp = SmPkt {
            pkt_type: SmPktType::DisconnectResp,
            err: SmErr::NoError,
            src_rpc_id: self.rpc_id,
            dst_rpc_id: pkt.src_rpc_id,
            src_session_num: pkt.dst_session_num,
            dst_session_num: pkt.src_session_num,
            src_session_gen: pkt.dst_session_gen,
            dst_session_gen: pkt.src_session_gen,
            sm_req_num: pkt.sm_req_num,
            payload: 0,
            src_hostname: self.sm.borrow().local_uri().to_string(),
            dp_route: String::new(),
        };
        let mut sm = self.sm.borrow_mut();
        if let Err(e) = sm.send(&resp, src) {
            warn!("SM response send failed: {}", e);
        }
        sm.record_processed(&pkt, src, Some(resp));
    }

    fn handle_disconnect_resp(&self, pkt: SmPkt) {
        let pending = match self.sm.borrow_mut().take_pending(pkt.sm_req_num) {
            Some(p) => p,
            None => return,
        };

        {
            let mut sessions = self.sessions.borrow_mut();
            let matches = sessions
                .get(pending.session_num)
                .map(|s| {
                    s.generation == pending.generation
                        && s.state == SessionState::DisconnectInProgress
                })
                .unwrap_or(false);
            if !matches {
                return;
            }
            let mut sess = sessions.remove(pending.session_num).unwrap();
            self.free_session_resources(&mut sess);
        }
        debug!("session {}: disconnected", pending.session_num);
        self.fire_sm_event(SmEvent {
            session_num: pending.session_num,
            kind: SmEventKind::Disconnected,
        });
    }

    fn handle_reset_peer(&self, pkt: SmPkt) {
        let valid = {
            let sessions = self.sessions.borrow();
            sessions
                .get(pkt.dst_session_num)
                .map(|s| s.generation == pkt.dst_session_gen)
                .unwrap_or(false)
        };
        if !valid {
            warn!("reset-peer for unknown or stale session {}", pkt.dst_session_num);
            return;
        }
        debug!("session {}: reset by peer", pkt.dst_session_num);
        self.session_error(pkt.dst_session_num, SmEventKind::PeerReset);
    }

    fn handle_drop_tx_remote(&self, pkt: SmPkt) {
        #[cfg(feature = "fault-injection")]
        {
            debug!("fault: peer asked us to drop {} transmissions", pkt.payload);
            self.faults.borrow_mut().add_drop_tx_remote(pkt.payload);
        }
        #[cfg(not(feature = "fault-injection"))]
        {
            let _ = pkt;
            warn!("drop-TX-remote request ignored: fault injection is compiled out");
        }
    }

    // -------------------------------------------------------------------
    // TX primitives
    // -------------------------------------------------------------------

    fn post_dp_pkt(&self, route: &RouteInfo, bytes: &[u8]) {
        #[cfg(feature = "fault-injection")]
        if self.faults.borrow_mut().should_drop_tx() {
            debug!("fault: dropping a {}-byte packet to {}", bytes.len(), route);
            return;
        }

        match self.transport.borrow_mut().post_tx(route, bytes) {
            Ok(()) => {}
            Err(Error::TransportBusy) => {
                // Treated as loss; the retransmission timer recovers.
                trace!("transport busy; packet to {} dropped", route);
            }
            Err(e) => warn!("post_tx to {} failed: {}", route, e),
        }
    }

    fn post_ctrl_pkt(&self, route: &RouteInfo, hdr: &PktHdr) {
        let mut buf = [0u8; PKT_HDR_SIZE];
        hdr.write_to(&mut buf);
        self.post_dp_pkt(route, &buf);
    }

    fn post_ecr(&self, route: &RouteInfo, remote_sn: u8, req_hdr: &PktHdr) {
        let ecr = PktHdr::new(
            PktType::Ecr,
            remote_sn,
            req_hdr.req_type,
            req_hdr.msg_size,
            req_hdr.pkt_num,
            req_hdr.req_num,
        );
        self.post_ctrl_pkt(route, &ecr);
    }
}

impl Drop for Rpc {
    fn drop(&mut self) {
        // Background workers are joined by BgPool's Drop. Frames still
        // attached to sessions go down with the pool region.
        let mut sessions = self.sessions.borrow_mut();
        let nums: Vec<u16> = sessions.iter().map(|s| s.local_session_num).collect();
        for num in nums {
            if let Some(mut sess) = sessions.remove(num) {
                self.free_session_resources(&mut sess);
            }
        }
    }
}
