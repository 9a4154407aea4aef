//! The exchange protocol: peer-to-peer unicast messages that propagate lock
//! release and cache-invalidation requests between nodes (spec §4.6).

pub mod manager;
pub mod message;
pub mod transport;

pub use manager::{ExchangeManager, InvalidationSink};
pub use message::{DecodeError, ExchangeMessage};
pub use transport::{InMemoryTransport, PeerId, Transport, TransportError};
