//! Session and slot management.
//!
//! A session is a bidirectional logical channel to one remote endpoint.
//! Each session owns a fixed ring of request slots; a slot holds at most
//! one in-flight request at a time, and request numbers assigned to a slot
//! are strictly increasing in steps of the window size.

use std::net::SocketAddr;

use crate::buffer::MsgBuffer;
use crate::reliability::PktBitmap;
use crate::transport::RouteInfo;

/// Session number that names no session (used in SM packets before the
/// peer's number is known).
pub const INVALID_SESSION_NUM: u16 = u16::MAX;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Freshly created, no handshake issued yet.
    Reset,
    /// Connect request sent, waiting for the response.
    ConnectInProgress,
    /// Session is connected and usable for requests.
    Connected,
    /// Disconnect request sent, waiting for the response.
    DisconnectInProgress,
    /// Session failed (connect timeout, peer reset, or protocol violation).
    Error,
}

/// Which side of the session this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Idle; may take a new request.
    Free,
    /// Client: request fragments still being credited out.
    TxRequest,
    /// Client: all request fragments sent, no response fragment seen.
    WaitResponse,
    /// Client: response partially received.
    RxResponse,
    /// Client: response complete, continuation queued but not yet run.
    Complete,
    /// Server: request partially received.
    RxRequest,
    /// Server: request dispatched or response in flight.
    Responding,
}

/// A session request slot.
///
/// Holds one in-flight request/response transaction. The generic parameter
/// carries the caller's per-request state (continuation and tag).
pub struct SSlot<U> {
    /// Slot index within the session.
    pub index: usize,
    /// Current slot state.
    pub state: SlotState,
    /// Request number of the transaction occupying the slot.
    pub cur_req_num: u32,
    /// Client: next request number to assign to this slot.
    pub next_req_num: u32,
    /// Server: request number the slot currently expects or serves.
    pub server_req_num: u32,
    /// Request type of the current transaction.
    pub req_type: u8,
    /// Per-request user state (continuation, tag).
    pub user_data: Option<U>,

    // Client-side request transmission.
    /// Request buffer, borrowed from the user until completion.
    pub req_msgbuf: Option<MsgBuffer>,
    /// Response buffer, borrowed from the user until completion.
    pub resp_msgbuf: Option<MsgBuffer>,
    /// Remaining permission to put request fragments in flight.
    pub credits: usize,
    /// Request fragments transmitted at least once.
    pub tx_bitmap: PktBitmap,
    /// Request fragments acknowledged by ECR or by the response.
    pub ack_bitmap: PktBitmap,
    /// Response fragments received.
    pub resp_rx_bitmap: PktBitmap,
    /// Total response fragments; zero until the first response fragment.
    pub resp_num_pkts: u32,
    /// Next response fragment to pull with an RFR.
    pub rfr_next: u32,
    /// Retransmission timeouts taken by the current request.
    pub retries: u32,
    /// Timestamp of the last TX or RX progress on this slot.
    pub last_event_us: u64,

    // Server-side request reception and response transmission.
    /// Request reassembly buffer.
    pub rx_msgbuf: Option<MsgBuffer>,
    /// Request fragments received.
    pub rx_bitmap: PktBitmap,
    /// Preallocated single-packet response scratch.
    pub pre_resp_msgbuf: Option<MsgBuffer>,
    /// Response being transmitted; kept for RFR re-sends until the client
    /// reuses the slot.
    pub tx_resp_msgbuf: Option<MsgBuffer>,
    /// Whether `tx_resp_msgbuf` is the preallocated scratch.
    pub tx_resp_prealloc: bool,
}

impl<U> SSlot<U> {
    /// Create a free slot.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Free,
            cur_req_num: 0,
            next_req_num: index as u32,
            server_req_num: index as u32,
            req_type: 0,
            user_data: None,
            req_msgbuf: None,
            resp_msgbuf: None,
            credits: 0,
            tx_bitmap: PktBitmap::default(),
            ack_bitmap: PktBitmap::default(),
            resp_rx_bitmap: PktBitmap::default(),
            resp_num_pkts: 0,
            rfr_next: 0,
            retries: 0,
            last_event_us: 0,
            rx_msgbuf: None,
            rx_bitmap: PktBitmap::default(),
            pre_resp_msgbuf: None,
            tx_resp_msgbuf: None,
            tx_resp_prealloc: false,
        }
    }

    /// Check if the slot is free.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    /// Claim the slot for a new client request and assign its request
    /// number. The window-strided numbering keeps per-slot request numbers
    /// strictly increasing.
    pub fn start_request(
        &mut self,
        window: usize,
        req_type: u8,
        num_req_pkts: u32,
        credits: usize,
        user_data: U,
        now_us: u64,
    ) -> u32 {
        debug_assert!(self.is_free());
        let req_num = self.next_req_num;
        self.next_req_num = self.next_req_num.wrapping_add(window as u32);

        self.state = SlotState::TxRequest;
        self.cur_req_num = req_num;
        self.req_type = req_type;
        self.user_data = Some(user_data);
        self.credits = credits;
        self.tx_bitmap.reset(num_req_pkts);
        self.ack_bitmap.reset(num_req_pkts);
        self.resp_rx_bitmap.reset(0);
        self.resp_num_pkts = 0;
        self.rfr_next = 1;
        self.retries = 0;
        self.last_event_us = now_us;
        req_num
    }

    /// Return the slot to the free state after the client transaction
    /// finished. Buffers must already have been moved out.
    pub fn reset_client(&mut self) {
        debug_assert!(self.req_msgbuf.is_none() && self.resp_msgbuf.is_none());
        self.state = SlotState::Free;
        self.user_data = None;
        self.tx_bitmap.reset(0);
        self.ack_bitmap.reset(0);
        self.resp_rx_bitmap.reset(0);
        self.resp_num_pkts = 0;
        self.retries = 0;
    }
}

/// Descriptor of the remote endpoint a session talks to.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer SM URI as given to `create_session` (or observed on accept).
    pub hostname: String,
    /// Peer SM socket address.
    pub sm_addr: SocketAddr,
    /// Peer RPC id.
    pub rpc_id: u8,
    /// Peer datapath routing info; learned during the handshake.
    pub dp_route: Option<RouteInfo>,
    /// Peer's session number for this channel.
    pub remote_session_num: u16,
    /// Peer's session generation, used to reject cross-incarnation SM
    /// packets.
    pub remote_gen: u32,
}

/// A session.
pub struct Session<U> {
    /// Local session number (index into the session table).
    pub local_session_num: u16,
    /// Generation of the table entry this session occupies.
    pub generation: u32,
    /// Role of this endpoint on the session.
    pub role: SessionRole,
    /// Session state.
    pub state: SessionState,
    /// Remote endpoint descriptor.
    pub peer: PeerInfo,
    /// Request slots.
    pub slots: Vec<SSlot<U>>,
    /// Request window size (power of two).
    pub req_window: usize,
}

impl<U> Session<U> {
    /// Create a new session.
    pub fn new(
        local_session_num: u16,
        generation: u32,
        role: SessionRole,
        peer: PeerInfo,
        req_window: usize,
    ) -> Self {
        debug_assert!(req_window.is_power_of_two());
        let slots = (0..req_window).map(SSlot::new).collect();
        Self {
            local_session_num,
            generation,
            role,
            state: SessionState::Reset,
            peer,
            slots,
            req_window,
        }
    }

    /// Check if the session is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Check if this endpoint is the session's client.
    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Slot index serving the given request number.
    #[inline]
    pub fn slot_for_req(&self, req_num: u32) -> usize {
        (req_num as usize) & (self.req_window - 1)
    }

    /// Find a free slot for a new request.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_free())
    }

    /// Number of slots currently holding an in-flight transaction.
    pub fn in_flight_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

/// Dense table of sessions indexed by local session number.
///
/// Freed entries keep a per-index generation counter so stale weak handles
/// `(session_num, generation)` can be rejected instead of dereferencing a
/// reused entry.
pub struct SessionTable<U> {
    entries: Vec<Option<Session<U>>>,
    generations: Vec<u32>,
    next_session_num: usize,
}

impl<U> SessionTable<U> {
    /// Create a table with capacity for `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        debug_assert!(max_sessions <= 255);
        Self {
            entries: (0..max_sessions).map(|_| None).collect(),
            generations: vec![0; max_sessions],
            next_session_num: 0,
        }
    }

    /// Create a session. Returns its session number.
    pub fn create(
        &mut self,
        role: SessionRole,
        peer: PeerInfo,
        req_window: usize,
    ) -> Option<u16> {
        let start = self.next_session_num;
        for i in 0..self.entries.len() {
            let idx = (start + i) % self.entries.len();
            if self.entries[idx].is_none() {
                self.next_session_num = (idx + 1) % self.entries.len();
                let generation = self.generations[idx];
                self.entries[idx] =
                    Some(Session::new(idx as u16, generation, role, peer, req_window));
                return Some(idx as u16);
            }
        }
        None
    }

    /// Get a session by number.
    pub fn get(&self, session_num: u16) -> Option<&Session<U>> {
        self.entries.get(session_num as usize).and_then(|s| s.as_ref())
    }

    /// Get a session mutably by number.
    pub fn get_mut(&mut self, session_num: u16) -> Option<&mut Session<U>> {
        self.entries.get_mut(session_num as usize).and_then(|s| s.as_mut())
    }

    /// Get a session mutably, validating the generation of a weak handle.
    pub fn get_mut_gen(&mut self, session_num: u16, generation: u32) -> Option<&mut Session<U>> {
        self.get_mut(session_num).filter(|s| s.generation == generation)
    }

    /// Remove a session, bumping the entry's generation.
    pub fn remove(&mut self, session_num: u16) -> Option<Session<U>> {
        let idx = session_num as usize;
        let removed = self.entries.get_mut(idx).and_then(|s| s.take());
        if removed.is_some() {
            self.generations[idx] = self.generations[idx].wrapping_add(1);
        }
        removed
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session<U>> {
        self.entries.iter().filter_map(|s| s.as_ref())
    }
}
