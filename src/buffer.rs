//! Packet buffer pool and message buffers.
//!
//! The pool is one contiguous, huge-page-advised region carved into
//! fixed-size frames managed by a free list. A [`MsgBuffer`] is the
//! user-visible view of a message: a logically contiguous payload scattered
//! across one or more frames, each frame holding a packet header area
//! followed by a payload chunk.

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::packet::PKT_HDR_SIZE;

/// Huge page size assumed for the pool region.
pub const HUGE_PAGE_SIZE: usize = 2 << 20;

/// A single fixed-size frame owned by a MsgBuffer.
#[derive(Debug)]
pub(crate) struct Frame {
    idx: u32,
    ptr: *mut u8,
}

/// Fixed-size frame pool in a single registered-memory-style region.
///
/// Alloc and free are O(1) per frame. The free list sits behind a mutex so
/// background request handlers may allocate and free message buffers; the
/// frame contents are only ever touched by whichever context owns the
/// enclosing MsgBuffer.
pub struct PktBufPool {
    region: *mut u8,
    frame_size: usize,
    num_frames: usize,
    free: Mutex<Vec<u32>>,
}

unsafe impl Send for PktBufPool {}
unsafe impl Sync for PktBufPool {}

impl PktBufPool {
    /// Create a pool of `num_frames` frames of `frame_size` bytes each.
    ///
    /// `frame_size` is the transport MTU: header area plus payload chunk.
    pub fn new(num_frames: usize, frame_size: usize) -> Result<Self> {
        if num_frames == 0 {
            return Err(Error::InvalidConfig("num_frames must be nonzero"));
        }
        if frame_size <= PKT_HDR_SIZE {
            return Err(Error::InvalidConfig("frame_size must exceed the packet header"));
        }

        let region_len = num_frames * frame_size;
        let align = if region_len >= HUGE_PAGE_SIZE { HUGE_PAGE_SIZE } else { 4096 };

        let region = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, align, region_len);
            if ret != 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(ret)));
            }
            #[cfg(target_os = "linux")]
            {
                // Best effort; the pool works on 4K pages too.
                libc::madvise(ptr, region_len, libc::MADV_HUGEPAGE);
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, region_len);
            ptr as *mut u8
        };

        let free = (0..num_frames as u32).rev().collect();

        Ok(Self {
            region,
            frame_size,
            num_frames,
            free: Mutex::new(free),
        })
    }

    /// Payload bytes per frame.
    #[inline]
    pub fn data_per_pkt(&self) -> usize {
        self.frame_size - PKT_HDR_SIZE
    }

    /// Frame size (the transport MTU).
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of free frames.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Total number of frames.
    #[inline]
    pub fn total(&self) -> usize {
        self.num_frames
    }

    #[inline]
    fn frame_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!((idx as usize) < self.num_frames);
        unsafe { self.region.add(idx as usize * self.frame_size) }
    }

    /// Allocate a MsgBuffer able to hold `max_data_size` payload bytes.
    ///
    /// All frames are taken or none are. The buffer starts with
    /// `data_size == max_data_size`.
    pub fn alloc_msg(&self, max_data_size: usize, preallocated: bool) -> Result<MsgBuffer> {
        let needed = max_data_size.div_ceil(self.data_per_pkt()).max(1);

        let mut free = self.free.lock();
        if free.len() < needed {
            return Err(Error::OutOfBuffers);
        }
        let frames: Vec<Frame> = (0..needed)
            .map(|_| {
                let idx = free.pop().unwrap();
                Frame { idx, ptr: self.frame_ptr(idx) }
            })
            .collect();
        drop(free);

        Ok(MsgBuffer {
            frames,
            data_per_pkt: self.data_per_pkt(),
            max_data_size,
            data_size: max_data_size,
            preallocated,
        })
    }

    /// Return a MsgBuffer's frames to the pool.
    pub fn free_msg(&self, mut buf: MsgBuffer) {
        let mut free = self.free.lock();
        for frame in buf.frames.drain(..) {
            debug_assert!(!free.contains(&frame.idx));
            free.push(frame.idx);
        }
    }
}

impl Drop for PktBufPool {
    fn drop(&mut self) {
        let outstanding = self.num_frames - self.free.lock().len();
        if outstanding != 0 {
            log::debug!("packet pool dropped with {} frames outstanding", outstanding);
        }
        unsafe {
            libc::free(self.region as *mut libc::c_void);
        }
    }
}

/// A message buffer: a logically contiguous payload of up to
/// `max_data_size` bytes scattered across pool frames.
///
/// Each frame holds a [`PKT_HDR_SIZE`] header area followed by a payload
/// chunk, so fragments can be handed to the transport without staging
/// copies. The payload size may be shrunk with [`resize`](Self::resize)
/// but never grown.
#[derive(Debug)]
pub struct MsgBuffer {
    frames: Vec<Frame>,
    data_per_pkt: usize,
    max_data_size: usize,
    data_size: usize,
    preallocated: bool,
}

// Frames point into the pool region and are exclusively owned by this
// buffer until it is freed, so the view may cross threads with the buffer.
unsafe impl Send for MsgBuffer {}

impl MsgBuffer {
    /// Current payload size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Maximum payload size this buffer was allocated for.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    /// Whether this is a preallocated response scratch buffer rather than a
    /// dynamically allocated one.
    #[inline]
    pub fn is_preallocated(&self) -> bool {
        self.preallocated
    }

    /// Number of packets the current payload fragments into.
    #[inline]
    pub fn num_pkts(&self) -> u32 {
        self.data_size.div_ceil(self.data_per_pkt) as u32
    }

    /// Shrink the payload to `size` bytes without reallocation.
    ///
    /// # Panics
    /// Panics if `size` exceeds the allocated maximum.
    pub fn resize(&mut self, size: usize) {
        assert!(size <= self.max_data_size, "MsgBuffer grown beyond allocation");
        self.data_size = size;
    }

    /// Payload chunk length of packet `pkt_num`.
    #[inline]
    fn chunk_len(&self, pkt_num: u32) -> usize {
        let start = pkt_num as usize * self.data_per_pkt;
        debug_assert!(start < self.data_size || self.data_size == 0);
        (self.data_size - start).min(self.data_per_pkt)
    }

    /// Payload chunk of packet `pkt_num`.
    pub fn pkt_payload(&self, pkt_num: u32) -> &[u8] {
        let len = self.chunk_len(pkt_num);
        let frame = &self.frames[pkt_num as usize];
        unsafe { std::slice::from_raw_parts(frame.ptr.add(PKT_HDR_SIZE), len) }
    }

    /// Mutable payload chunk of packet `pkt_num`.
    pub fn pkt_payload_mut(&mut self, pkt_num: u32) -> &mut [u8] {
        let len = self.chunk_len(pkt_num);
        let frame = &self.frames[pkt_num as usize];
        unsafe { std::slice::from_raw_parts_mut(frame.ptr.add(PKT_HDR_SIZE), len) }
    }

    /// The raw frame bytes of packet `pkt_num` (header area plus the full
    /// payload capacity), for transports to receive into.
    pub(crate) fn frame_bytes_mut(&mut self, pkt_num: u32) -> &mut [u8] {
        let frame = &self.frames[pkt_num as usize];
        unsafe { std::slice::from_raw_parts_mut(frame.ptr, PKT_HDR_SIZE + self.data_per_pkt) }
    }

    /// The full wire view of packet `pkt_num` (header area plus chunk),
    /// with `hdr` serialized into the header area.
    pub(crate) fn wire_pkt(&mut self, pkt_num: u32, hdr: &crate::packet::PktHdr) -> &[u8] {
        let len = PKT_HDR_SIZE + self.chunk_len(pkt_num);
        let frame = &self.frames[pkt_num as usize];
        let bytes = unsafe { std::slice::from_raw_parts_mut(frame.ptr, len) };
        hdr.write_to(bytes);
        &bytes[..len]
    }

    /// Copy `src` into the buffer and set the payload size to match.
    ///
    /// # Panics
    /// Panics if `src` exceeds the allocated maximum.
    pub fn copy_in(&mut self, src: &[u8]) {
        self.resize(src.len());
        for pkt in 0..self.num_pkts() {
            let start = pkt as usize * self.data_per_pkt;
            let len = self.chunk_len(pkt);
            self.pkt_payload_mut(pkt).copy_from_slice(&src[start..start + len]);
        }
    }

    /// Copy the payload chunk of `pkt_num` in from reassembly.
    pub(crate) fn write_chunk(&mut self, pkt_num: u32, chunk: &[u8]) {
        debug_assert_eq!(chunk.len(), self.chunk_len(pkt_num));
        self.pkt_payload_mut(pkt_num).copy_from_slice(chunk);
    }

    /// Gather the payload into a Vec.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_size);
        for pkt in 0..self.num_pkts() {
            out.extend_from_slice(self.pkt_payload(pkt));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_alloc_free() {
        let pool = PktBufPool::new(8, 1024).unwrap();
        assert_eq!(pool.available(), 8);
        assert_eq!(pool.data_per_pkt(), 1024 - PKT_HDR_SIZE);

        let buf = pool.alloc_msg(100, false).unwrap();
        assert_eq!(pool.available(), 7);
        assert_eq!(buf.data_size(), 100);
        assert_eq!(buf.num_pkts(), 1);

        pool.free_msg(buf);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = PktBufPool::new(2, 256).unwrap();
        let a = pool.alloc_msg(1, false).unwrap();
        let b = pool.alloc_msg(1, false).unwrap();
        assert!(matches!(pool.alloc_msg(1, false), Err(Error::OutOfBuffers)));

        // A multi-frame request must not partially drain the pool.
        pool.free_msg(a);
        assert!(matches!(
            pool.alloc_msg(3 * (256 - PKT_HDR_SIZE), false),
            Err(Error::OutOfBuffers)
        ));
        assert_eq!(pool.available(), 1);
        pool.free_msg(b);
    }

    #[test]
    fn test_msg_buffer_scatter_gather() {
        let pool = PktBufPool::new(32, 256).unwrap();
        let data_per_pkt = pool.data_per_pkt();

        let payload: Vec<u8> = (0..3 * data_per_pkt + 7).map(|i| (i % 251) as u8).collect();
        let mut buf = pool.alloc_msg(payload.len(), false).unwrap();
        assert_eq!(buf.num_pkts(), 4);

        buf.copy_in(&payload);
        assert_eq!(buf.to_vec(), payload);
        assert_eq!(buf.pkt_payload(3).len(), 7);

        pool.free_msg(buf);
    }

    #[test]
    fn test_msg_buffer_resize() {
        let pool = PktBufPool::new(8, 256).unwrap();
        let mut buf = pool.alloc_msg(200, true).unwrap();
        assert!(buf.is_preallocated());

        buf.resize(32);
        assert_eq!(buf.data_size(), 32);
        assert_eq!(buf.num_pkts(), 1);

        buf.resize(0);
        assert_eq!(buf.num_pkts(), 0);
        pool.free_msg(buf);
    }

    #[test]
    #[should_panic(expected = "grown beyond allocation")]
    fn test_msg_buffer_grow_panics() {
        let pool = PktBufPool::new(8, 256).unwrap();
        let mut buf = pool.alloc_msg(100, false).unwrap();
        buf.resize(101);
    }

    #[test]
    fn test_wire_pkt_layout() {
        use crate::packet::{PktHdr, PktType};

        let pool = PktBufPool::new(8, 256).unwrap();
        let mut buf = pool.alloc_msg(10, false).unwrap();
        buf.copy_in(b"0123456789");

        let hdr = PktHdr::new(PktType::Req, 3, 1, 10, 0, 0);
        let wire = buf.wire_pkt(0, &hdr);
        assert_eq!(wire.len(), PKT_HDR_SIZE + 10);
        assert_eq!(&wire[PKT_HDR_SIZE..], b"0123456789");

        let parsed = PktHdr::read_from(wire).unwrap();
        assert_eq!(parsed.msg_size, 10);
        pool.free_msg(buf);
    }
}
