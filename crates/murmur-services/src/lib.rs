//! murmur-services: the edge side of the uplink.
//!
//! Durable spool, token provider, transport, connection supervisor, and the
//! uplink manager that ties them together.

pub mod auth;
pub mod backoff;
pub mod connection;
pub mod manager;
pub mod spool;
pub mod supervisor;
pub mod transport;

pub use auth::{AuthError, HttpTokenProvider, TokenProvider};
pub use backoff::Backoff;
pub use connection::{ConnectionState, LinkHandle, LinkSnapshot, LinkWatch};
pub use manager::{ChunkOutcome, DrainOutcome, Route, UplinkManager, UplinkStats};
pub use spool::{RecordHandle, Spool, SpoolError};
pub use supervisor::{ConnectionSupervisor, SupervisorSettings};
pub use transport::{
    Connector, Inbound, Transport, TransportError, WebSocketConnector, WebSocketTransport,
};
