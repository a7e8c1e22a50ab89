//! Tool providers: subprocesses that speak newline-delimited JSON-RPC 2.0 on
//! stdio, aggregated into a single provider-qualified tool catalog.

pub mod connection;
pub mod framing;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::ProviderCommand;
pub use registry::{LoadSummary, ToolRegistry, DEFAULT_SEPARATOR};
pub use transport::{
    connect, Lifecycle, PooledTransport, SpawnPerCallTransport, ToolTransport, TransportTimeouts,
};
