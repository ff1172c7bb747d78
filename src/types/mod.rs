//! Core data types shared across the node
//!
//! Identity of the local node, the credentials it stamps on outbound
//! batches, and the peer records returned by the registry.

mod identity;
mod peer;

pub use identity::*;
pub use peer::*;
