//! Agentic Memory Server Library
//!
//! Request schemas, validation and the JSON-RPC stdio transport for the
//! agentic memory store.

pub mod config;
pub mod error;
pub mod handlers;
pub mod rpc;

pub use config::Args;
pub use error::{ServerError, ServerResult};
pub use rpc::{LineTransport, RpcServer};
