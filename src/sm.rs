//! Session-management (SM) protocol.
//!
//! The control plane runs out-of-band over a per-endpoint UDP socket and
//! carries the connect/disconnect handshakes and fault-injection packets.
//! SM requests are made reliable by the endpoint's own timer-driven
//! retransmission; receivers deduplicate on the per-peer monotonically
//! increasing `sm_req_num` and re-send the cached response for duplicates.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use fnv::FnvHashMap;
use log::{trace, warn};

use crate::error::{Error, Result};

/// Maximum encoded SM record size.
pub const SM_MAX_PKT_SIZE: usize = 512;

/// SM packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    /// Client asks the server to accept a new session.
    ConnectReq = 1,
    /// Server's answer to a connect request.
    ConnectResp = 2,
    /// Client asks the server to tear a session down.
    DisconnectReq = 3,
    /// Server's answer to a disconnect request.
    DisconnectResp = 4,
    /// Fault injection: force the named session into the error state.
    FaultResetPeerReq = 5,
    /// Fault injection: ask the peer to drop its next N transmissions.
    FaultDropTxRemote = 6,
}

impl SmPktType {
    /// Whether this kind is a request (as opposed to a response).
    pub fn is_request(self) -> bool {
        !matches!(self, SmPktType::ConnectResp | SmPktType::DisconnectResp)
    }

    /// Whether the sender retransmits this kind until a response arrives.
    pub fn expects_response(self) -> bool {
        matches!(self, SmPktType::ConnectReq | SmPktType::DisconnectReq)
    }
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SmPktType::ConnectReq),
            2 => Ok(SmPktType::ConnectResp),
            3 => Ok(SmPktType::DisconnectReq),
            4 => Ok(SmPktType::DisconnectResp),
            5 => Ok(SmPktType::FaultResetPeerReq),
            6 => Ok(SmPktType::FaultDropTxRemote),
            _ => Err(Error::InvalidPacket("unknown SM packet type")),
        }
    }
}

/// SM-level error carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErr {
    NoError = 0,
    /// The server has no free session table entry.
    NoSessionAvailable = 1,
    /// The request named an endpoint or session the server does not have.
    InvalidRemote = 2,
}

impl From<u8> for SmErr {
    fn from(value: u8) -> Self {
        match value {
            0 => SmErr::NoError,
            1 => SmErr::NoSessionAvailable,
            _ => SmErr::InvalidRemote,
        }
    }
}

/// An SM wire record.
///
/// Length-prefixed over UDP: a `u16` byte count followed by fixed fields
/// and two length-prefixed strings (the sender's SM URI and its datapath
/// route).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmPkt {
    pub pkt_type: SmPktType,
    pub err: SmErr,
    pub src_rpc_id: u8,
    pub dst_rpc_id: u8,
    pub src_session_num: u16,
    pub dst_session_num: u16,
    /// Generation of the sender's session entry.
    pub src_session_gen: u32,
    /// Generation the sender believes the receiver's entry has; receivers
    /// reject mismatches to fence off packets from earlier incarnations.
    pub dst_session_gen: u32,
    pub sm_req_num: u64,
    /// Kind-specific payload (e.g. the drop countdown).
    pub payload: u64,
    /// Sender's SM URI.
    pub src_hostname: String,
    /// Sender's datapath route, empty when not applicable.
    pub dp_route: String,
}

const SM_FIXED_LEN: usize = 32;

impl SmPkt {
    /// Serialize to a length-prefixed record.
    pub fn encode(&self) -> Vec<u8> {
        let host = self.src_hostname.as_bytes();
        let route = self.dp_route.as_bytes();
        let body_len = SM_FIXED_LEN + 2 + host.len() + 2 + route.len();
        let mut out = Vec::with_capacity(2 + body_len);

        out.extend_from_slice(&(body_len as u16).to_le_bytes());
        out.push(self.pkt_type as u8);
        out.push(self.err as u8);
        out.push(self.src_rpc_id);
        out.push(self.dst_rpc_id);
        out.extend_from_slice(&self.src_session_num.to_le_bytes());
        out.extend_from_slice(&self.dst_session_num.to_le_bytes());
        out.extend_from_slice(&self.src_session_gen.to_le_bytes());
        out.extend_from_slice(&self.dst_session_gen.to_le_bytes());
        out.extend_from_slice(&self.sm_req_num.to_le_bytes());
        out.extend_from_slice(&self.payload.to_le_bytes());
        out.extend_from_slice(&(host.len() as u16).to_le_bytes());
        out.extend_from_slice(host);
        out.extend_from_slice(&(route.len() as u16).to_le_bytes());
        out.extend_from_slice(route);
        out
    }

    /// Parse a length-prefixed record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(Error::InvalidPacket("SM record shorter than length prefix"));
        }
        let body_len = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
        let body = buf
            .get(2..2 + body_len)
            .ok_or(Error::InvalidPacket("SM record truncated"))?;
        if body.len() < SM_FIXED_LEN + 4 {
            return Err(Error::InvalidPacket("SM record too short"));
        }

        let read_str = |at: usize| -> Result<(String, usize)> {
            let len = u16::from_le_bytes(
                body.get(at..at + 2)
                    .ok_or(Error::InvalidPacket("SM string truncated"))?
                    .try_into()
                    .unwrap(),
            ) as usize;
            let bytes = body
                .get(at + 2..at + 2 + len)
                .ok_or(Error::InvalidPacket("SM string truncated"))?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::InvalidPacket("SM string not UTF-8"))?;
            Ok((s.to_string(), at + 2 + len))
        };

        let (src_hostname, at) = read_str(SM_FIXED_LEN)?;
        let (dp_route, _) = read_str(at)?;

        Ok(Self {
            pkt_type: SmPktType::try_from(body[0])?,
            err: SmErr::from(body[1]),
            src_rpc_id: body[2],
            dst_rpc_id: body[3],
            src_session_num: u16::from_le_bytes(body[4..6].try_into().unwrap()),
            dst_session_num: u16::from_le_bytes(body[6..8].try_into().unwrap()),
            src_session_gen: u32::from_le_bytes(body[8..12].try_into().unwrap()),
            dst_session_gen: u32::from_le_bytes(body[12..16].try_into().unwrap()),
            sm_req_num: u64::from_le_bytes(body[16..24].try_into().unwrap()),
            payload: u64::from_le_bytes(body[24..32].try_into().unwrap()),
            src_hostname,
            dp_route,
        })
    }
}

/// Session-management event delivered to the user's SM handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmEvent {
    /// Local session the event concerns.
    pub session_num: u16,
    /// What happened.
    pub kind: SmEventKind,
}

/// Kind of session-management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventKind {
    /// Connect handshake completed.
    Connected,
    /// Connect handshake failed or timed out.
    ConnectFailed,
    /// Disconnect handshake completed.
    Disconnected,
    /// The peer reset the session.
    PeerReset,
    /// The session failed on the datapath.
    SessionError,
}

/// User callback for SM events.
pub type SmEventHandler = Box<dyn FnMut(SmEvent)>;

/// An SM request awaiting its response.
pub struct PendingSmReq {
    pub pkt: SmPkt,
    pub dest: SocketAddr,
    pub session_num: u16,
    pub generation: u32,
    pub next_retry_us: u64,
    pub retries: u32,
}

/// Verdict of the duplicate check for an inbound SM request.
#[derive(Debug, PartialEq, Eq)]
pub enum SmDedupVerdict {
    /// First sighting; process it.
    New,
    /// Same `sm_req_num` as the last processed request; the cached
    /// response (if any) has been re-sent.
    Duplicate,
    /// Older than the last processed request; drop silently.
    Stale,
}

struct SmDedupEntry {
    last_req_num: u64,
    cached_resp: Option<SmPkt>,
}

/// SM socket plus retransmission and dedup bookkeeping.
pub struct SmState {
    sock: UdpSocket,
    local_uri: String,
    next_sm_req_num: u64,
    /// Requests awaiting responses, retransmitted on a timer.
    pub pending: Vec<PendingSmReq>,
    /// Keyed by the observed UDP source and the peer's rpc_id, never by
    /// the self-reported hostname field: a sender cannot perturb another
    /// peer's dedup entry by forging the hostname.
    dedup: FnvHashMap<(SocketAddr, u8), SmDedupEntry>,
}

impl SmState {
    /// Bind the SM side channel.
    pub fn bind<A: ToSocketAddrs>(bind_addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(bind_addr)?;
        sock.set_nonblocking(true)?;
        let local_uri = sock.local_addr()?.to_string();
        Ok(Self {
            sock,
            local_uri,
            next_sm_req_num: 1,
            pending: Vec::new(),
            dedup: FnvHashMap::default(),
        })
    }

    /// This endpoint's SM URI ("host:port").
    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    /// Allocate the next per-endpoint SM request number.
    pub fn alloc_req_num(&mut self) -> u64 {
        let n = self.next_sm_req_num;
        self.next_sm_req_num += 1;
        n
    }

    /// Transmit one SM record.
    pub fn send(&self, pkt: &SmPkt, dest: SocketAddr) -> Result<()> {
        trace!("SM tx {:?} -> {}", pkt.pkt_type, dest);
        self.sock.send_to(&pkt.encode(), dest)?;
        Ok(())
    }

    /// Transmit a request and arm its retransmission. The first
    /// transmission goes to `first_dest`; retries go to `retry_dest`
    /// (they differ only under the stale-routing-info fault).
    pub fn send_request(
        &mut self,
        pkt: SmPkt,
        first_dest: SocketAddr,
        retry_dest: SocketAddr,
        session_num: u16,
        generation: u32,
        now_us: u64,
        timeout_ms: u64,
    ) {
        if let Err(e) = self.send(&pkt, first_dest) {
            // The retry timer will try again.
            warn!("SM send to {} failed: {}", first_dest, e);
        }
        if pkt.pkt_type.expects_response() {
            self.pending.push(PendingSmReq {
                pkt,
                dest: retry_dest,
                session_num,
                generation,
                next_retry_us: now_us + timeout_ms * 1000,
                retries: 0,
            });
        }
    }

    /// Poll the SM socket for one record.
    pub fn poll(&mut self) -> Option<(SmPkt, SocketAddr)> {
        let mut buf = [0u8; SM_MAX_PKT_SIZE];
        loop {
            match self.sock.recv_from(&mut buf) {
                Ok((len, src)) => match SmPkt::decode(&buf[..len]) {
                    Ok(pkt) => return Some((pkt, src)),
                    Err(e) => {
                        warn!("dropping malformed SM record from {}: {}", src, e);
                        continue;
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    warn!("SM socket error: {}", e);
                    return None;
                }
            }
        }
    }

    /// Remove and return the pending request a response answers.
    pub fn take_pending(&mut self, sm_req_num: u64) -> Option<PendingSmReq> {
        let idx = self.pending.iter().position(|p| p.pkt.sm_req_num == sm_req_num)?;
        Some(self.pending.swap_remove(idx))
    }

    /// Duplicate-check an inbound request against the sender's observed
    /// source address; for exact duplicates, re-send the cached response.
    pub fn dedup_check(&mut self, pkt: &SmPkt, src: SocketAddr) -> SmDedupVerdict {
        match self.dedup.get(&(src, pkt.src_rpc_id)) {
            Some(entry) if pkt.sm_req_num < entry.last_req_num => SmDedupVerdict::Stale,
            Some(entry) if pkt.sm_req_num == entry.last_req_num => {
                if let Some(resp) = &entry.cached_resp {
                    if let Err(e) = self.send(resp, src) {
                        warn!("SM cached-response resend failed: {}", e);
                    }
                }
                SmDedupVerdict::Duplicate
            }
            _ => SmDedupVerdict::New,
        }
    }

    /// Record a processed request and optionally cache its response for
    /// idempotent re-sends.
    pub fn record_processed(&mut self, pkt: &SmPkt, src: SocketAddr, resp: Option<SmPkt>) {
        self.dedup.insert(
            (src, pkt.src_rpc_id),
            SmDedupEntry {
                last_req_num: pkt.sm_req_num,
                cached_resp: resp,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pkt() -> SmPkt {
        SmPkt {
            pkt_type: SmPktType::ConnectReq,
            err: SmErr::NoError,
            src_rpc_id: 1,
            dst_rpc_id: 2,
            src_session_num: 3,
            dst_session_num: INVALID,
            src_session_gen: 7,
            dst_session_gen: 0,
            sm_req_num: 42,
            payload: 0,
            src_hostname: "127.0.0.1:31850".to_string(),
            dp_route: "127.0.0.1:31851".to_string(),
        }
    }

    const INVALID: u16 = crate::session::INVALID_SESSION_NUM;

    #[test]
    fn test_sm_pkt_roundtrip() {
        let pkt = sample_pkt();
        let bytes = pkt.encode();
        let decoded = SmPkt::decode(&bytes).unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn test_sm_pkt_truncated() {
        let bytes = sample_pkt().encode();
        assert!(SmPkt::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(SmPkt::decode(&bytes[..1]).is_err());
        assert!(SmPkt::decode(&[]).is_err());
    }

    #[test]
    fn test_sm_pkt_kinds() {
        assert!(SmPktType::ConnectReq.is_request());
        assert!(SmPktType::FaultResetPeerReq.is_request());
        assert!(!SmPktType::ConnectResp.is_request());
        assert!(SmPktType::ConnectReq.expects_response());
        assert!(!SmPktType::FaultDropTxRemote.expects_response());
    }

    #[test]
    fn test_sm_dedup() {
        let mut sm = SmState::bind("127.0.0.1:0").unwrap();
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut pkt = sample_pkt();

        assert_eq!(sm.dedup_check(&pkt, src), SmDedupVerdict::New);
        sm.record_processed(&pkt, src, None);

        assert_eq!(sm.dedup_check(&pkt, src), SmDedupVerdict::Duplicate);

        pkt.sm_req_num = 41;
        assert_eq!(sm.dedup_check(&pkt, src), SmDedupVerdict::Stale);

        pkt.sm_req_num = 43;
        assert_eq!(sm.dedup_check(&pkt, src), SmDedupVerdict::New);
    }

    #[test]
    fn test_sm_dedup_keys_on_observed_source() {
        let mut sm = SmState::bind("127.0.0.1:0").unwrap();
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let pkt = sample_pkt();
        sm.record_processed(&pkt, src, None);

        // A different sender claiming the same hostname and rpc_id but
        // with an older request number gets its own dedup entry instead
        // of colliding with the real peer's.
        let other: SocketAddr = "127.0.0.1:9998".parse().unwrap();
        let mut forged = sample_pkt();
        forged.sm_req_num = 1;
        assert_eq!(sm.dedup_check(&forged, other), SmDedupVerdict::New);

        // The real peer's entry is untouched.
        assert_eq!(sm.dedup_check(&pkt, src), SmDedupVerdict::Duplicate);
    }

    #[test]
    fn test_sm_req_num_monotonic() {
        let mut sm = SmState::bind("127.0.0.1:0").unwrap();
        let a = sm.alloc_req_num();
        let b = sm.alloc_req_num();
        assert!(b > a);
    }
}
