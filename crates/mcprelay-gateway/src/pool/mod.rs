//! Client Pool - upstream MCP connection management
//!
//! - **ClientHandle**: per-backend lifecycle state, refcount, roots cache
//! - **RelayClientHandler**: the client identity presented to upstreams
//! - **transport**: stdio (container) and streamable HTTP connectors
//! - **ClientPool**: borrow-and-release API with single-flight startup

mod handle;
#[allow(clippy::module_inception)]
mod pool;
pub mod transport;

pub use handle::{ClientHandle, HandleState, RelayClientHandler, UpstreamClient};
pub use pool::{ClientPool, PoolStats};
