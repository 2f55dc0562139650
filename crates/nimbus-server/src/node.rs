//! Assembly of one storage node: four service loops plus handoff replay.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nimbus_client::{ResilientClient, SpaceAccountingClient};
use nimbus_handoff::{HandoffCoordinator, HandoffReplayer, HandoffStore, LinkSet};
use nimbus_store::{CacheConfig, CacheManager, SegmentRepository};
use nimbus_types::NodeName;
use tracing::{error, info};

use crate::config::{ClusterConfig, NodeConfig, NodeEndpoints};
use crate::dispatcher::Dispatcher;
use crate::error::{ServerError, ServerResult};
use crate::service::{DatabaseService, HandoffService, ReaderService, Service, WriterService};

struct Worker {
    role: String,
    handle: JoinHandle<ServerResult<()>>,
}

/// A running storage node.
///
/// Every service endpoint is bound before any thread starts, so a bind
/// failure aborts startup without serving traffic. Dropping the node stops
/// it.
pub struct Node {
    name: NodeName,
    endpoints: NodeEndpoints,
    cache: Arc<CacheManager>,
    handoff_store: Arc<HandoffStore>,
    coordinator: HandoffCoordinator,
    writers: LinkSet,
    handoff_servers: LinkSet,
    clients: Vec<Arc<ResilientClient>>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<Worker>,
    stopped: bool,
}

impl Node {
    /// Opens the node's storage, binds its services and starts them.
    pub fn start(config: NodeConfig, cluster: &ClusterConfig) -> ServerResult<Self> {
        let name = config.node_name.clone();
        let local = cluster
            .node(&name)
            .cloned()
            .ok_or_else(|| ServerError::Config(format!("node {name} is not in the node list")))?;

        if !config.repository_path.is_dir() {
            return Err(ServerError::Config(format!(
                "repository {} does not exist",
                config.repository_path.display()
            )));
        }
        let node_dir = config.repository_path.join(name.as_str());
        fs::create_dir_all(&node_dir)?;

        let cache = Arc::new(CacheManager::new(
            CacheConfig::new(&config.repository_path).with_capacity(config.cache_capacity),
        ));
        let repository = SegmentRepository::new(&config.repository_path, &name);
        let handoff_store = Arc::new(HandoffStore::open(
            node_dir.join("handoff").join("handoff.redb"),
        )?);

        let mut clients = Vec::new();
        let accounting = match &config.space_accounting {
            Some(endpoint) => {
                let push = Arc::new(ResilientClient::connect(
                    NodeName::new("space-accounting"),
                    endpoint.clone(),
                    config.client.clone(),
                )?);
                clients.push(Arc::clone(&push));
                Some(SpaceAccountingClient::new(push, None))
            }
            None => None,
        };

        let database = Dispatcher::bind(
            config.dispatcher.clone(),
            &local.database,
            DatabaseService::new(name.clone(), Arc::clone(&cache)),
        )?;
        let writer = Dispatcher::bind(
            config.dispatcher.clone(),
            &local.writer,
            WriterService::new(
                name.clone(),
                Arc::clone(&cache),
                repository.clone(),
                accounting.clone(),
            ),
        )?;
        let reader = Dispatcher::bind(
            config.dispatcher.clone(),
            &local.reader,
            ReaderService::new(name.clone(), Arc::clone(&cache), repository, accounting),
        )?;
        let handoff = Dispatcher::bind(
            config.dispatcher.clone(),
            &local.handoff,
            HandoffService::new(Arc::clone(&handoff_store)),
        )?;
        let endpoints = NodeEndpoints {
            database: database.local_endpoint()?,
            writer: writer.local_endpoint()?,
            reader: reader.local_endpoint()?,
            handoff: handoff.local_endpoint()?,
        };

        let mut writers = LinkSet::new();
        let mut handoff_servers = LinkSet::new();
        for (peer, peer_endpoints) in cluster.nodes() {
            let writer_link = Arc::new(ResilientClient::connect(
                peer.clone(),
                peer_endpoints.writer.clone(),
                config.client.clone(),
            )?);
            let handoff_link = Arc::new(ResilientClient::connect(
                peer.clone(),
                peer_endpoints.handoff.clone(),
                config.client.clone(),
            )?);
            clients.push(Arc::clone(&writer_link));
            clients.push(Arc::clone(&handoff_link));
            writers.insert(writer_link);
            handoff_servers.insert(handoff_link);
        }

        let coordinator = HandoffCoordinator::new(
            config.handoff.clone(),
            writers.clone(),
            handoff_servers.clone(),
        );
        let mut replayer =
            HandoffReplayer::new(config.replay.clone(), Arc::clone(&handoff_store), writers.clone());

        let mut node = Self {
            name,
            endpoints,
            cache,
            handoff_store,
            coordinator,
            writers,
            handoff_servers,
            clients,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            stopped: false,
        };

        node.spawn_dispatcher(database)?;
        node.spawn_dispatcher(writer)?;
        node.spawn_dispatcher(reader)?;
        node.spawn_dispatcher(handoff)?;
        let shutdown = Arc::clone(&node.shutdown);
        node.spawn("handoff-replayer", move || {
            replayer.run(&shutdown);
            Ok(())
        })?;

        info!(node = %node.name, endpoints = ?node.endpoints, "node started");
        Ok(node)
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    /// The bound service endpoints.
    pub fn endpoints(&self) -> &NodeEndpoints {
        &self.endpoints
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn handoff_store(&self) -> &Arc<HandoffStore> {
        &self.handoff_store
    }

    /// Places segments on the cluster's writers with handoff on failure.
    pub fn coordinator(&self) -> &HandoffCoordinator {
        &self.coordinator
    }

    /// Cluster nodes whose writer and handoff services are both connected.
    pub fn reachable_nodes(&self) -> Vec<NodeName> {
        self.writers
            .iter()
            .filter(|writer| writer.is_reachable())
            .filter(|writer| {
                self.handoff_servers
                    .get(writer.node())
                    .is_some_and(|handoff| handoff.is_reachable())
            })
            .map(|writer| writer.node().clone())
            .collect()
    }

    /// Name of a service or task that has stopped while the node is
    /// running, if any.
    pub fn stopped_worker(&self) -> Option<&str> {
        self.workers
            .iter()
            .find(|worker| worker.handle.is_finished())
            .map(|worker| worker.role.as_str())
    }

    /// Stops every service, closes outbound connections and the store
    /// cache. Returns the first error a service stopped with.
    pub fn shutdown(mut self) -> ServerResult<()> {
        self.stop()
    }

    fn spawn_dispatcher<S: Service + 'static>(&mut self, mut dispatcher: Dispatcher<S>) -> ServerResult<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let role = dispatcher.service().name();
        self.spawn(role, move || dispatcher.run(&shutdown))
    }

    fn spawn<F>(&mut self, role: &str, work: F) -> ServerResult<()>
    where
        F: FnOnce() -> ServerResult<()> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("nimbus-{role}-{}", self.name))
            .spawn(work)?;
        self.workers.push(Worker {
            role: role.to_string(),
            handle,
        });
        Ok(())
    }

    fn stop(&mut self) -> ServerResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.shutdown.store(true, Ordering::SeqCst);
        // Fails the replayer's in-flight request instead of waiting it out.
        for client in self.clients.drain(..) {
            client.close();
        }

        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            let outcome = match worker.handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(ServerError::ServiceStopped(worker.role.clone())),
            };
            if let Err(e) = outcome {
                error!(node = %self.name, worker = %worker.role, error = %e, "worker failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        self.cache.shutdown();
        info!(node = %self.name, "node stopped");
        result
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}
