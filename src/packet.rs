//! Datapath packet header.
//!
//! Every datapath packet carries a 16-byte header with the metadata needed
//! for request/response correlation, reassembly, and flow control.

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 16;

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request packet.
    Req = 1,
    /// Response packet.
    Resp = 2,
    /// Request-for-response: pulls one additional response fragment.
    Rfr = 3,
    /// Explicit credit return: acknowledges one request fragment.
    Ecr = 4,
    /// Session management (out-of-band; never seen on the datapath socket).
    Sm = 5,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PktType::Req),
            2 => Ok(PktType::Resp),
            3 => Ok(PktType::Rfr),
            4 => Ok(PktType::Ecr),
            5 => Ok(PktType::Sm),
            _ => Err(Error::InvalidPacket("unknown packet type")),
        }
    }
}

bitflags! {
    /// Packet header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PktFlags: u8 {
        /// Packet is a retransmission.
        const RETRANSMIT = 1 << 0;
    }
}

/// Datapath packet header (16 bytes, little-endian).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     pkt_type
/// 1       1     flags
/// 2       1     dest_session_num
/// 3       1     req_type
/// 4       4     msg_size
/// 8       4     pkt_num
/// 12      4     req_num
/// ```
///
/// The destination session number rides in a single byte, which caps the
/// session table at 255 entries per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHdr {
    /// Packet type.
    pub pkt_type: PktType,
    /// Flags.
    pub flags: PktFlags,
    /// Destination session number in the receiver's table.
    pub dest_session_num: u8,
    /// Request type (application-defined).
    pub req_type: u8,
    /// Total message size in bytes.
    pub msg_size: u32,
    /// Packet number within the message (for ECR: the fragment it acks;
    /// for RFR: the fragment it requests).
    pub pkt_num: u32,
    /// Request number; strictly increasing per slot.
    pub req_num: u32,
}

impl PktHdr {
    /// Create a new packet header.
    pub fn new(
        pkt_type: PktType,
        dest_session_num: u8,
        req_type: u8,
        msg_size: u32,
        pkt_num: u32,
        req_num: u32,
    ) -> Self {
        Self {
            pkt_type,
            flags: PktFlags::empty(),
            dest_session_num,
            req_type,
            msg_size,
            pkt_num,
            req_num,
        }
    }

    /// Serialize into the first `PKT_HDR_SIZE` bytes of `dst`.
    ///
    /// # Panics
    /// Panics if `dst` is shorter than `PKT_HDR_SIZE`.
    pub fn write_to(&self, dst: &mut [u8]) {
        dst[0] = self.pkt_type as u8;
        dst[1] = self.flags.bits();
        dst[2] = self.dest_session_num;
        dst[3] = self.req_type;
        dst[4..8].copy_from_slice(&self.msg_size.to_le_bytes());
        dst[8..12].copy_from_slice(&self.pkt_num.to_le_bytes());
        dst[12..16].copy_from_slice(&self.req_num.to_le_bytes());
    }

    /// Deserialize from the first `PKT_HDR_SIZE` bytes of `src`.
    pub fn read_from(src: &[u8]) -> Result<Self> {
        if src.len() < PKT_HDR_SIZE {
            return Err(Error::InvalidPacket("packet shorter than header"));
        }
        Ok(Self {
            pkt_type: PktType::try_from(src[0])?,
            flags: PktFlags::from_bits_truncate(src[1]),
            dest_session_num: src[2],
            req_type: src[3],
            msg_size: u32::from_le_bytes(src[4..8].try_into().unwrap()),
            pkt_num: u32::from_le_bytes(src[8..12].try_into().unwrap()),
            req_num: u32::from_le_bytes(src[12..16].try_into().unwrap()),
        })
    }

    /// Check if this is a request packet.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.pkt_type == PktType::Req
    }

    /// Check if this is a response packet.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.pkt_type == PktType::Resp
    }

    /// Calculate the number of packets for a message of `msg_size` bytes
    /// given `data_per_pkt` payload bytes per packet.
    pub fn calc_num_pkts(msg_size: usize, data_per_pkt: usize) -> u32 {
        msg_size.div_ceil(data_per_pkt) as u32
    }
}
