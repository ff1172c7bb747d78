//! Peer-to-peer data exchange
//!
//! The receiver side accepts connections and stores decoded batches in a
//! [`ReceivedStore`]; the dispatcher side sends one batch to each matching
//! peer the registry reports, tracking delivery in a [`PeerTracker`].

mod dispatcher;
mod receiver;
mod store;
mod tracker;

pub use dispatcher::{DispatchConfig, Dispatcher};
pub use receiver::{serve_connection, OnReceive, ReceiveContext, ReceivedBatch, Receiver};
pub use store::ReceivedStore;
pub use tracker::PeerTracker;
