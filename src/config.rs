//! Configuration types for packrpc.

/// RPC endpoint configuration.
///
/// Controls request multiplexing, flow control, reliability, and the
/// background handler pool.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (concurrent requests per session, power of two).
    /// Default: 8
    pub req_window: usize,
    /// Per-request credits: packets that may be in flight without an
    /// explicit credit return.
    /// Default: 8
    pub session_credits: usize,
    /// Datapath retransmission timeout in microseconds.
    /// Default: 5000 (5ms)
    pub rto_us: u64,
    /// Maximum datapath retransmissions before the session is failed.
    /// Default: 5
    pub max_retries: u32,
    /// Session-management request timeout in milliseconds.
    /// Default: 500
    pub sm_timeout_ms: u64,
    /// Maximum SM retransmissions before connect/disconnect is failed.
    /// Default: 3
    pub sm_max_retries: u32,
    /// Maximum number of sessions (wire limit: 255).
    /// Default: 64
    pub max_sessions: usize,
    /// Number of fixed-size frames in the packet buffer pool.
    /// Default: 512
    pub num_frames: usize,
    /// Maximum message size in bytes.
    /// Default: 1 MiB
    pub max_msg_size: usize,
    /// Number of background handler threads. Zero means all handlers must
    /// be registered as foreground.
    /// Default: 0
    pub num_bg_threads: usize,
    /// Depth of the background work and return queues.
    /// Default: 256
    pub bg_queue_depth: usize,
    /// Maximum packets drained from the transport per event-loop pass.
    /// Default: 32
    pub rx_batch: usize,
    /// Maximum continuations run per event-loop pass.
    /// Default: 16
    pub cont_batch: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 8,
            rto_us: 5000,
            max_retries: 5,
            sm_timeout_ms: 500,
            sm_max_retries: 3,
            max_sessions: 64,
            num_frames: 512,
            max_msg_size: 1 << 20,
            num_bg_threads: 0,
            bg_queue_depth: 256,
            rx_batch: 32,
            cont_batch: 16,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        self.req_window = req_window;
        self
    }

    /// Set the per-request credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the datapath retransmission timeout.
    pub fn with_rto_us(mut self, rto_us: u64) -> Self {
        self.rto_us = rto_us;
        self
    }

    /// Set the maximum datapath retransmissions.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the SM request timeout.
    pub fn with_sm_timeout_ms(mut self, sm_timeout_ms: u64) -> Self {
        self.sm_timeout_ms = sm_timeout_ms;
        self
    }

    /// Set the maximum SM retransmissions.
    pub fn with_sm_max_retries(mut self, sm_max_retries: u32) -> Self {
        self.sm_max_retries = sm_max_retries;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the packet buffer pool size.
    pub fn with_num_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = num_frames;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the number of background handler threads.
    pub fn with_bg_threads(mut self, num_bg_threads: usize) -> Self {
        self.num_bg_threads = num_bg_threads;
        self
    }

    /// Validate the configuration.
    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;
        if !self.req_window.is_power_of_two() {
            return Err(Error::InvalidConfig("req_window must be a power of two"));
        }
        if self.session_credits == 0 {
            return Err(Error::InvalidConfig("session_credits must be nonzero"));
        }
        if self.max_sessions == 0 || self.max_sessions > 255 {
            return Err(Error::InvalidConfig("max_sessions must be in 1..=255"));
        }
        if self.num_frames == 0 {
            return Err(Error::InvalidConfig("num_frames must be nonzero"));
        }
        Ok(())
    }
}
