//! Arrow-data streaming gateway.
//!
//! Connectors open reverse tunnels (WebSocket or gRPC) and register
//! under a tenant; browsers open validated streaming sessions and
//! query named datasets, receiving record batches forwarded from the
//! owning connector.

pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stream;
pub mod tunnel;

pub use error::GatewayError;
pub use registry::ConnectorRegistry;
pub use session::SessionManager;
pub use stream::{create_router, AppState};
