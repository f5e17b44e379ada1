//! JSON-RPC 2.0 over line-delimited stdio

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use server::RpcServer;
pub use transport::{Incoming, LineTransport, ResponseWriter};
