//! Otter node
//!
//! Independently deployed nodes find each other through a discovery
//! registry and exchange one-shot data batches over direct TCP connections.
//!
//! ```no_run
//! use otter_node::{NodeConfig, Node, PayloadMap, Value};
//!
//! # async fn demo() -> otter_node::Result<()> {
//! let config = NodeConfig::for_node(
//!     5000,
//!     "c1",
//!     "client",
//!     "CPU",
//!     "http://consul:8500",
//!     vec!["server".to_string()],
//! );
//! let node = Node::start(config, None).await?;
//!
//! let mut payload = PayloadMap::new();
//! payload.insert("var1".to_string(), Value::Int(42));
//! node.send_data_to_peers(payload)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod peer;
pub mod registry;
pub mod types;
pub mod wire;

pub use config::NodeConfig;
pub use error::{Error, ErrorCode, Result};
pub use node::Node;
pub use peer::{OnReceive, ReceivedBatch};
pub use types::{Credentials, NodeIdentity, PeerRecord};
pub use wire::{payload_from_json, DType, NdArray, PayloadMap, Value};
