//! JSON-RPC 2.0 protocol types for the tool-call surface

mod messages;

pub use messages::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
