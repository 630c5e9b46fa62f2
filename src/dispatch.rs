//! Request dispatch: handler registry, handler capability surface, and the
//! background worker pool.
//!
//! The registry maps request types to handlers and is frozen before the
//! endpoint starts polling. Foreground handlers run inline on the owning
//! thread; background handlers run on a small worker pool and talk back to
//! the owner through bounded lock-free queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use log::{error, warn};

use crate::buffer::{MsgBuffer, PktBufPool};
use crate::error::{dp_fatal, Error, Result};
use crate::rpc::{RespHandle, Rpc};

/// Execution class of a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// Run inline on the endpoint's owning thread.
    Foreground,
    /// Run on the background worker pool.
    Background,
}

/// Request handler callback.
pub type ReqHandlerFn = Arc<dyn Fn(ReqHandle, &RespondCtx<'_>) + Send + Sync>;

/// Client continuation, fired exactly once per enqueued request.
pub type Continuation = Box<dyn FnOnce(&Rpc, RespHandle)>;

pub(crate) struct ReqFunc {
    pub handler: ReqHandlerFn,
    pub mode: HandlerMode,
}

/// Registry mapping request types to handlers.
///
/// Populated during process init and frozen into an `Arc` before any
/// endpoint is built; registration is impossible afterwards.
pub struct ReqFuncRegistry {
    funcs: Vec<Option<ReqFunc>>,
}

impl Default for ReqFuncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqFuncRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            funcs: (0..=u8::MAX as usize).map(|_| None).collect(),
        }
    }

    /// Register a handler for `req_type`.
    pub fn register<F>(&mut self, req_type: u8, mode: HandlerMode, handler: F) -> Result<()>
    where
        F: Fn(ReqHandle, &RespondCtx<'_>) + Send + Sync + 'static,
    {
        let entry = &mut self.funcs[req_type as usize];
        if entry.is_some() {
            return Err(Error::InvalidArgument("request type already registered"));
        }
        *entry = Some(ReqFunc {
            handler: Arc::new(handler),
            mode,
        });
        Ok(())
    }

    /// Freeze the registry. The returned handle is shared by endpoints and
    /// admits no further registration.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub(crate) fn get(&self, req_type: u8) -> Option<&ReqFunc> {
        self.funcs[req_type as usize].as_ref()
    }

    /// Whether any registered handler runs in the background.
    pub(crate) fn has_background(&self) -> bool {
        self.funcs
            .iter()
            .flatten()
            .any(|f| f.mode == HandlerMode::Background)
    }
}

/// Server-side handle for one received request.
///
/// Owns the reassembled request and the slot's preallocated response
/// scratch. The handler either shrinks and fills `pre_resp_msgbuf`
/// (leaving `prealloc_used` true) or attaches a dynamically allocated
/// response and clears `prealloc_used`, then passes the handle to
/// `enqueue_response`.
pub struct ReqHandle {
    pub(crate) session_num: u16,
    pub(crate) generation: u32,
    pub(crate) slot_idx: usize,
    pub(crate) req_num: u32,
    /// Request type of the inbound request.
    pub req_type: u8,
    pub(crate) req_msgbuf: Option<MsgBuffer>,
    /// Preallocated single-packet response scratch.
    pub pre_resp_msgbuf: MsgBuffer,
    /// Dynamically allocated response, if the scratch is too small.
    pub dyn_resp_msgbuf: Option<MsgBuffer>,
    /// Whether the response lives in the preallocated scratch.
    pub prealloc_used: bool,
}

impl ReqHandle {
    /// The reassembled request payload.
    pub fn req_msgbuf(&self) -> &MsgBuffer {
        self.req_msgbuf.as_ref().expect("request buffer already released")
    }
}

/// A request dispatched to the background pool.
pub(crate) struct BgWork {
    pub handler: ReqHandlerFn,
    pub handle: ReqHandle,
}

/// A request enqueued by a background handler, executed by the owner on
/// its next event-loop pass.
pub(crate) struct DeferredRequest {
    pub session_num: u16,
    pub req_type: u8,
    pub req: MsgBuffer,
    pub resp: MsgBuffer,
    pub cont: Box<dyn FnOnce(&Rpc, RespHandle) + Send>,
    pub tag: u64,
}

/// Queues shared between the owning thread and the background pool.
pub(crate) struct BgChannels {
    /// Owner -> workers: requests for background handlers.
    pub work: ArrayQueue<BgWork>,
    /// Workers -> owner: responses ready to transmit.
    pub done: ArrayQueue<ReqHandle>,
    /// Workers -> owner: nested requests from background handlers.
    pub deferred: ArrayQueue<DeferredRequest>,
    pub max_msg_size: usize,
}

impl BgChannels {
    pub fn new(depth: usize, max_msg_size: usize) -> Self {
        Self {
            work: ArrayQueue::new(depth),
            done: ArrayQueue::new(depth),
            deferred: ArrayQueue::new(depth),
            max_msg_size,
        }
    }
}

/// Capability surface handed to request handlers.
///
/// Foreground handlers get direct access to the owning endpoint;
/// background handlers get only the pool and the return queues. Control
/// plane operations are denied in both contexts.
pub struct RespondCtx<'a> {
    inner: CtxInner<'a>,
}

enum CtxInner<'a> {
    Foreground(&'a Rpc),
    Background {
        pool: &'a Arc<PktBufPool>,
        channels: &'a BgChannels,
    },
}

impl<'a> RespondCtx<'a> {
    pub(crate) fn foreground(rpc: &'a Rpc) -> Self {
        Self {
            inner: CtxInner::Foreground(rpc),
        }
    }

    pub(crate) fn background(pool: &'a Arc<PktBufPool>, channels: &'a BgChannels) -> Self {
        Self {
            inner: CtxInner::Background { pool, channels },
        }
    }

    /// Allocate a message buffer from the endpoint's pool.
    pub fn alloc_msg_buffer(&self, size: usize) -> Result<MsgBuffer> {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.alloc_msg_buffer(size),
            CtxInner::Background { pool, channels } => {
                if size > channels.max_msg_size {
                    return Err(Error::MessageTooLarge {
                        size,
                        max: channels.max_msg_size,
                    });
                }
                pool.alloc_msg(size, false)
            }
        }
    }

    /// Return a message buffer to the pool.
    pub fn free_msg_buffer(&self, buf: MsgBuffer) {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.free_msg_buffer(buf),
            CtxInner::Background { pool, .. } => pool.free_msg(buf),
        }
    }

    /// Hand a filled request handle back for response transmission.
    pub fn enqueue_response(&self, handle: ReqHandle) {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.enqueue_response(handle),
            CtxInner::Background { channels, .. } => {
                let mut handle = handle;
                for _ in 0..64 {
                    match channels.done.push(handle) {
                        Ok(()) => return,
                        Err(h) => {
                            handle = h;
                            std::thread::yield_now();
                        }
                    }
                }
                error!("background response queue full; response dropped");
            }
        }
    }

    /// Enqueue a nested request on the same endpoint.
    ///
    /// From a background handler the request is deferred to the owner's
    /// next event-loop pass; enqueue errors then surface as a failed
    /// continuation instead of a synchronous error.
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
        F: FnOnce(&Rpc, RespHandle) + Send + 'static,
    {
        match &self.inner {
            CtxInner::Foreground(rpc) => {
                rpc.enqueue_request(session_num, req_type, req, resp, cont, tag)
            }
            CtxInner::Background { channels, .. } => {
                let deferred = DeferredRequest {
                    session_num,
                    req_type,
                    req,
                    resp,
                    cont: Box::new(cont),
                    tag,
                };
                channels
                    .deferred
                    .push(deferred)
                    .map_err(|_| Error::NoFreeSlots)
            }
        }
    }

    /// Session creation is a control-plane operation and is denied from
    /// any handler context.
    pub fn create_session(&self, remote_uri: &str, remote_rpc_id: u8) -> Result<u16> {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.create_session(remote_uri, remote_rpc_id),
            CtxInner::Background { .. } => Err(Error::PermissionDenied),
        }
    }

    /// Session destruction is a control-plane operation and is denied from
    /// any handler context.
    pub fn destroy_session(&self, session_num: u16) -> Result<()> {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.destroy_session(session_num),
            CtxInner::Background { .. } => Err(Error::PermissionDenied),
        }
    }

    /// Running the event loop from a handler is forbidden.
    pub fn run_event_loop_once(&self) {
        match &self.inner {
            CtxInner::Foreground(rpc) => rpc.run_event_loop_once(),
            CtxInner::Background { .. } => {
                dp_fatal!("event loop invoked from a background request handler");
            }
        }
    }
}

/// Background worker pool. Workers drain the work queue until shutdown.
pub(crate) struct BgPool {
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl BgPool {
    pub fn spawn(num_threads: usize, channels: Arc<BgChannels>, pool: Arc<PktBufPool>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = (0..num_threads)
            .map(|i| {
                let channels = channels.clone();
                let pool = pool.clone();
                let shutdown = shutdown.clone();
                std::thread::Builder::new()
                    .name(format!("packrpc-bg-{}", i))
                    .spawn(move || {
                        loop {
                            match channels.work.pop() {
                                Some(work) => {
                                    let ctx = RespondCtx::background(&pool, &channels);
                                    (work.handler)(work.handle, &ctx);
                                }
                                None => {
                                    if shutdown.load(Ordering::Acquire) {
                                        break;
                                    }
                                    std::thread::yield_now();
                                }
                            }
                        }
                    })
                    .expect("failed to spawn background worker")
            })
            .collect();

        Self { shutdown, workers }
    }
}

impl Drop for BgPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("background worker exited by panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = ReqFuncRegistry::new();
        registry
            .register(1, HandlerMode::Foreground, |_h, _ctx| {})
            .unwrap();
        registry
            .register(2, HandlerMode::Background, |_h, _ctx| {})
            .unwrap();

        // Double registration of a type is rejected.
        assert!(registry.register(1, HandlerMode::Foreground, |_h, _ctx| {}).is_err());

        let frozen = registry.freeze();
        assert!(frozen.get(1).is_some());
        assert_eq!(frozen.get(2).unwrap().mode, HandlerMode::Background);
        assert!(frozen.get(3).is_none());
        assert!(frozen.has_background());
    }

    #[test]
    fn test_registry_no_background() {
        let mut registry = ReqFuncRegistry::new();
        registry
            .register(9, HandlerMode::Foreground, |_h, _ctx| {})
            .unwrap();
        assert!(!registry.has_background());
    }
}
