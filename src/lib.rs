//! # packrpc - user-space RPC for microsecond-scale networking
//!
//! This crate implements a per-endpoint RPC runtime for reliable
//! request/response exchange over unreliable packet transports, in the
//! style of kernel-bypass datacenter RPC systems.
//!
//! ## Features
//!
//! - **Session multiplexing**: many logical sessions over one transport,
//!   each with a fixed window of concurrent requests
//! - **Credit-based flow control**: ECR packets clock out large requests,
//!   RFR packets pull large responses
//! - **Selective retransmission**: per-fragment bitmaps; a timeout resends
//!   only the fragments the receiver has not acknowledged
//! - **Out-of-band control plane**: reliable connect/disconnect handshakes
//!   and fault-injection packets over a UDP side channel
//! - **Foreground and background handlers**: requests run inline on the
//!   owning thread or on a worker pool with a restricted capability set
//!
//! ## Usage
//!
//! ```ignore
//! use packrpc::{HandlerMode, ReqFuncRegistry, Rpc, RpcConfig, UdpTransport};
//!
//! // Register handlers, then freeze the registry.
//! let mut registry = ReqFuncRegistry::new();
//! registry.register(1, HandlerMode::Foreground, |mut req, ctx| {
//!     let data = req.req_msgbuf().to_vec();
//!     req.pre_resp_msgbuf.copy_in(&data); // echo
//!     ctx.enqueue_response(req);
//! })?;
//! let registry = registry.freeze();
//!
//! // Build an endpoint; the calling thread becomes its creator.
//! let transport = UdpTransport::bind("0.0.0.0:31851", 1024)?;
//! let rpc = Rpc::new(registry, Box::new(transport), "0.0.0.0:31850", 0,
//!                    RpcConfig::default(), None)?;
//!
//! // Connect a session and send a request.
//! let session = rpc.create_session("server-host:31850", 0)?;
//! let req = rpc.alloc_msg_buffer(32)?;
//! let resp = rpc.alloc_msg_buffer(32)?;
//! rpc.enqueue_request(session, 1, req, resp, |rpc, resp_handle| {
//!     println!("got {} response bytes", resp_handle.resp_msgbuf.data_size());
//!     rpc.release_response(resp_handle);
//! }, 0)?;
//!
//! // Drive everything from the event loop.
//! loop {
//!     rpc.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: endpoint configuration (`RpcConfig`)
//! - [`packet`]: datapath wire header (`PktHdr`)
//! - [`buffer`]: frame pool and message buffers (`PktBufPool`, `MsgBuffer`)
//! - [`transport`]: transport abstraction (`Transport`, `UdpTransport`)
//! - [`session`]: session and slot state machines
//! - [`sm`]: session-management protocol and events
//! - [`reliability`]: per-fragment delivery bitmaps
//! - [`timing`]: timing wheel for retransmission deadlines
//! - [`dispatch`]: handler registry and background worker pool
//! - [`fault`]: deterministic fault injection (feature `fault-injection`)
//! - [`rpc`]: the endpoint (`Rpc`) and its event loop

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(feature = "fault-injection")]
pub mod fault;
pub mod packet;
pub mod reliability;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;

// Re-export main types
pub use buffer::{MsgBuffer, PktBufPool};
pub use config::RpcConfig;
pub use dispatch::{HandlerMode, ReqFuncRegistry, ReqHandle, RespondCtx};
pub use error::{Error, Result};
pub use packet::{PktFlags, PktHdr, PktType, PKT_HDR_SIZE};
pub use rpc::{RespHandle, Rpc};
pub use session::{SessionRole, SessionState};
pub use sm::{SmEvent, SmEventHandler, SmEventKind, SmPkt, SmPktType};
pub use transport::{RouteInfo, Transport, UdpTransport};
