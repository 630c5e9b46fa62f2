//! Deterministic fault injection.
//!
//! Compiled only with the `fault-injection` feature; the hooks are invoked
//! from the send engine and the SM handler. Mutators on [`crate::Rpc`]
//! assert the creator thread and abort when the feature is compiled out.

/// Fault-injection state, one record per endpoint.
#[derive(Debug, Default)]
pub(crate) struct FaultState {
    /// Local TX drop countdown; when it reaches zero the next packet is
    /// dropped instead of posted, and the fault disarms.
    drop_tx_local: Option<u64>,
    /// Peer-requested TX drops still owed.
    drop_tx_remote: u64,
    /// Force the next connect attempt to carry wrong remote parameters.
    resolve_server_rinfo: bool,
}

impl FaultState {
    /// Arm the local TX drop countdown.
    pub fn arm_drop_tx_local(&mut self, countdown: u64) {
        self.drop_tx_local = if countdown == 0 { None } else { Some(countdown) };
    }

    /// Record a peer's request to drop our next `count` transmissions.
    pub fn add_drop_tx_remote(&mut self, count: u64) {
        self.drop_tx_remote += count;
    }

    /// Arm the stale-routing-info connect fault.
    pub fn arm_resolve_server_rinfo(&mut self) {
        self.resolve_server_rinfo = true;
    }

    /// Consume the stale-routing-info fault if armed.
    pub fn take_resolve_server_rinfo(&mut self) -> bool {
        std::mem::take(&mut self.resolve_server_rinfo)
    }

    /// Called once per datapath transmission. Returns true if this packet
    /// must be dropped instead of posted.
    pub fn should_drop_tx(&mut self) -> bool {
        if self.drop_tx_remote > 0 {
            self.drop_tx_remote -= 1;
            return true;
        }
        if let Some(c) = self.drop_tx_local.as_mut() {
            *c -= 1;
            if *c == 0 {
                self.drop_tx_local = None;
                return true;
            }
        }
        false
    }
}
