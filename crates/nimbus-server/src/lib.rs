//! # nimbus-server: Storage node services
//!
//! A storage node runs four services, each on its own thread with its own
//! endpoint, plus a handoff replayer.
//!
//! ## Architecture
//!
//! Every service is a [`Service`] driven by a [`Dispatcher`]: a `mio` poll
//! loop that accepts connections, decodes frames and routes each request to
//! the service. There is no async runtime.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                               Node                               │
//! │  ┌──────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────┐ │
//! │  │  database    │  │ data-writer │  │ data-reader │  │ handoff │ │
//! │  │ (Dispatcher) │  │ (Dispatcher)│  │ (Dispatcher)│  │ server  │ │
//! │  └──────┬───────┘  └──────┬──────┘  └──────┬──────┘  └────┬────┘ │
//! │         ▼                 ▼                ▼              ▼      │
//! │  ┌──────────────────────────────────────────────┐  ┌───────────┐ │
//! │  │ CacheManager (SegmentStore per tenant)       │  │ Handoff   │ │
//! │  │ SegmentRepository (segment files)            │  │ Store     │ │
//! │  └──────────────────────────────────────────────┘  └─────┬─────┘ │
//! │                                  HandoffReplayer ◀───────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use nimbus_server::{ClusterConfig, Node, NodeConfig};
//!
//! let cluster = ClusterConfig::from_lists(&names, &database, &writer, &reader, &handoff)?;
//! let node = Node::start(NodeConfig::new(name, "/var/lib/nimbus"), &cluster)?;
//! // ...
//! node.shutdown()?;
//! ```

mod config;
mod connection;
mod dispatcher;
mod error;
mod node;
pub mod service;

pub use config::{ClusterConfig, DispatcherConfig, NodeConfig, NodeEndpoints};
pub use connection::EndpointRole;
pub use dispatcher::Dispatcher;
pub use error::{ServerError, ServerResult};
pub use node::Node;
pub use service::{DatabaseService, HandoffService, ReaderService, Service, WriterService};
