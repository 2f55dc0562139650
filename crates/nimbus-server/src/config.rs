//! Dispatcher, node and cluster configuration.

use std::path::PathBuf;
use std::time::Duration;

use nimbus_client::{ClientConfig, DEFAULT_BUFFER_SIZE, Endpoint};
use nimbus_handoff::{HandoffConfig, ReplayConfig};
use nimbus_store::DEFAULT_CACHE_CAPACITY;
use nimbus_types::NodeName;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Configuration of one service's dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent connections.
    pub max_connections: usize,
    /// Read and write buffer size per connection.
    pub buffer_size: usize,
    /// Connections with no activity for this duration are closed.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on one poll wait, so shutdown is noticed promptly.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: Some(Duration::from_secs(300)),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the idle connection timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Disables idle timeout (connections never time out).
    pub fn without_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// The four service endpoints of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoints {
    pub database: Endpoint,
    pub writer: Endpoint,
    pub reader: Endpoint,
    pub handoff: Endpoint,
}

/// The static node list and every node's service endpoints.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    nodes: Vec<(NodeName, NodeEndpoints)>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, name: NodeName, endpoints: NodeEndpoints) -> Self {
        self.nodes.push((name, endpoints));
        self
    }

    /// Builds the cluster from the node list and parallel address lists.
    pub fn from_lists(
        names: &[String],
        database: &[String],
        writer: &[String],
        reader: &[String],
        handoff: &[String],
    ) -> ServerResult<Self> {
        for (what, list) in [
            ("database server", database),
            ("data writer", writer),
            ("data reader", reader),
            ("handoff server", handoff),
        ] {
            if list.len() != names.len() {
                return Err(ServerError::Config(format!(
                    "{} {what} addresses for {} nodes",
                    list.len(),
                    names.len()
                )));
            }
        }

        let parse = |address: &String| {
            address
                .parse::<Endpoint>()
                .map_err(|e| ServerError::Config(format!("bad address {address}: {e}")))
        };

        let mut cluster = Self::new();
        for (i, name) in names.iter().enumerate() {
            let name = NodeName::new(name.as_str());
            if cluster.node(&name).is_some() {
                return Err(ServerError::Config(format!("node {name} listed twice")));
            }
            let endpoints = NodeEndpoints {
                database: parse(&database[i])?,
                writer: parse(&writer[i])?,
                reader: parse(&reader[i])?,
                handoff: parse(&handoff[i])?,
            };
            cluster = cluster.with_node(name, endpoints);
        }
        Ok(cluster)
    }

    pub fn node(&self, name: &NodeName) -> Option<&NodeEndpoints> {
        self.nodes
            .iter()
            .find(|(node, _)| node == name)
            .map(|(_, endpoints)| endpoints)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeName, &NodeEndpoints)> {
        self.nodes.iter().map(|(name, endpoints)| (name, endpoints))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Everything one node process needs besides the cluster list.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: NodeName,
    /// Root holding `{node}/databases`, `{node}/segments` and
    /// `{node}/handoff`. Must exist.
    pub repository_path: PathBuf,
    pub cache_capacity: usize,
    pub dispatcher: DispatcherConfig,
    /// Used for every outbound connection.
    pub client: ClientConfig,
    pub handoff: HandoffConfig,
    pub replay: ReplayConfig,
    /// Pull endpoint of the space accounting collector.
    pub space_accounting: Option<Endpoint>,
}

impl NodeConfig {
    pub fn new(node_name: NodeName, repository_path: impl Into<PathBuf>) -> Self {
        Self {
            node_name,
            repository_path: repository_path.into(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            dispatcher: DispatcherConfig::default(),
            client: ClientConfig::default(),
            handoff: HandoffConfig::default(),
            replay: ReplayConfig::default(),
            space_accounting: None,
        }
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_handoff(mut self, handoff: HandoffConfig) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_replay(mut self, replay: ReplayConfig) -> Self {
        self.replay = replay;
        self
    }

    pub fn with_space_accounting(mut self, endpoint: Endpoint) -> Self {
        self.space_accounting = Some(endpoint);
        self
    }
}
