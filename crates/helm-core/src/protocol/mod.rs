//! Wire contracts carried by transport front-ends: JSON-RPC requests in,
//! SSE frames out.

pub mod jsonrpc;
pub mod sse;

pub use jsonrpc::{RpcDispatcher, RpcError, RpcNotification, RpcRequest, RpcResponse};
pub use sse::{LAST_EVENT_ID_HEADER, frame, frames, parse_last_event_id};
