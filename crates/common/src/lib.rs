//! Shared wire-protocol types for the Arrow streaming gateway.

pub mod error;
pub mod messages;
pub mod ticket;

pub use error::Error;
pub use messages::{ConnectorFrame, GatewayCommand};
pub use ticket::Ticket;
