use super::{
    Connection, ConnectionErrorKind, Connector, NodeAddr, Role, StoreError, StoreResult,
    TopologyEvent, TopologyKind,
};
use crate::script::{self, KeySet, Keyspace, Script};
use core::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{sync::broadcast, time::Instant};

/// An in-process store deployment.
///
/// Every node keeps its own key space, script cache and replication role.
/// Nothing is replicated between nodes, so a promoted replica starts without
/// the script or the shard ID, which is exactly what a fresh primary looks
/// like after a failover.
///
/// Store time is the wall clock at construction advanced by
/// [`tokio::time::Instant`], so tests running with paused time move the
/// store's clock and key expiry along with the runtime.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    deployment: Mutex<Deployment>,
    topology: broadcast::Sender<TopologyEvent>,
    wall_origin: SystemTime,
    origin: Instant,
}

struct Deployment {
    kind: TopologyKind,
    nodes: BTreeMap<NodeAddr, Node>,
    password: Option<String>,
}

struct Node {
    role: Role,
    up: bool,
    connect_delay: Duration,
    keys: HashMap<String, Entry>,
    scripts: HashMap<String, Script>,
}

impl Node {
    fn new(role: Role) -> Self {
        Self {
            role,
            up: true,
            connect_delay: Duration::ZERO,
            keys: HashMap::new(),
            scripts: HashMap::new(),
        }
    }
}

struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Deployment {
    /// The node keyed commands land on.
    fn route<'a>(&'a self, connected: &'a NodeAddr) -> StoreResult<&'a NodeAddr> {
        match self.kind {
            TopologyKind::Cluster => self
                .nodes
                .iter()
                .find(|(_, n)| n.up && n.role == Role::Primary)
                .map(|(addr, _)| addr)
                .ok_or_else(|| {
                    StoreError::connection(ConnectionErrorKind::Closed, "cluster has no primary")
                }),
            TopologyKind::Single | TopologyKind::Sentinel => Ok(connected),
        }
    }

    fn node_mut(&mut self, addr: &NodeAddr) -> StoreResult<&mut Node> {
        match self.nodes.get_mut(addr) {
            Some(node) if node.up => Ok(node),
            _ => Err(StoreError::connection(
                ConnectionErrorKind::Closed,
                format!("connection to {addr} reset by peer"),
            )),
        }
    }
}

impl MemoryStore {
    fn with_nodes(kind: TopologyKind, nodes: BTreeMap<NodeAddr, Node>) -> Self {
        let (topology, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                deployment: Mutex::new(Deployment {
                    kind,
                    nodes,
                    password: None,
                }),
                topology,
                wall_origin: SystemTime::now(),
                origin: Instant::now(),
            }),
        }
    }

    /// One standalone node.
    pub fn single(addr: NodeAddr) -> Self {
        Self::with_nodes(
            TopologyKind::Single,
            BTreeMap::from([(addr, Node::new(Role::Primary))]),
        )
    }

    /// A cluster of primaries sharing one key space.
    pub fn cluster(addrs: impl IntoIterator<Item = NodeAddr>) -> Self {
        let nodes = addrs
            .into_iter()
            .map(|addr| (addr, Node::new(Role::Primary)))
            .collect();
        Self::with_nodes(TopologyKind::Cluster, nodes)
    }

    /// A supervised primary with replicas that can be promoted.
    pub fn replicated(primary: NodeAddr, replicas: impl IntoIterator<Item = NodeAddr>) -> Self {
        let mut nodes: BTreeMap<_, _> = replicas
            .into_iter()
            .map(|addr| (addr, Node::new(Role::Replica)))
            .collect();
        nodes.insert(primary, Node::new(Role::Primary));
        Self::with_nodes(TopologyKind::Sentinel, nodes)
    }

    /// A connector targeting this deployment.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
            target: None,
            password: None,
        }
    }

    /// A connector pinned to `addr`, which need not exist.
    pub fn connector_for(&self, addr: NodeAddr) -> MemoryConnector {
        MemoryConnector {
            target: Some(addr),
            ..self.connector()
        }
    }

    /// Requires `password` on every new connection.
    pub fn require_password(&self, password: impl Into<String>) {
        self.shared.deployment.lock().password = Some(password.into());
    }

    /// Takes a node down or brings it back. Open sessions to a down node fail.
    pub fn set_node_down(&self, addr: &NodeAddr, down: bool) {
        if let Some(node) = self.shared.deployment.lock().nodes.get_mut(addr) {
            node.up = !down;
        }
    }

    /// Delays every new connection to `addr`.
    pub fn set_connect_delay(&self, addr: &NodeAddr, delay: Duration) {
        if let Some(node) = self.shared.deployment.lock().nodes.get_mut(addr) {
            node.connect_delay = delay;
        }
    }

    /// Promotes `addr` and demotes every other node.
    pub fn failover(&self, addr: &NodeAddr) {
        let mut deployment = self.shared.deployment.lock();
        for (node_addr, node) in deployment.nodes.iter_mut() {
            node.role = if node_addr == addr {
                Role::Primary
            } else {
                Role::Replica
            };
        }
    }

    /// Adds a primary to the cluster and announces it.
    pub fn add_node(&self, addr: NodeAddr) {
        self.shared
            .deployment
            .lock()
            .nodes
            .insert(addr.clone(), Node::new(Role::Primary));
        let _ = self.shared.topology.send(TopologyEvent::NodeAdded(addr));
    }

    /// Removes a node from the cluster and announces it.
    pub fn remove_node(&self, addr: &NodeAddr) {
        let removed = self.shared.deployment.lock().nodes.remove(addr).is_some();
        if removed {
            let _ = self
                .shared
                .topology
                .send(TopologyEvent::NodeRemoved(addr.clone()));
        }
    }

    /// Reads an integer key from the current primary.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        let mut deployment = self.shared.deployment.lock();
        let addr = self.primary(&deployment)?;
        let node = deployment.nodes.get_mut(&addr)?;
        NodeKeys::new(node, now, self.shared.wall_origin, self.shared.origin)
            .get_int(key)
            .ok()
            .flatten()
    }

    /// Writes an integer key on the current primary.
    pub fn set(&self, key: &str, value: i64) {
        let mut deployment = self.shared.deployment.lock();
        let Some(addr) = self.primary(&deployment) else {
            return;
        };
        if let Some(node) = deployment.nodes.get_mut(&addr) {
            node.keys.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at: None,
                },
            );
        }
    }

    /// Returns `true` if `addr` has the script with `sha` cached.
    pub fn script_loaded(&self, addr: &NodeAddr, sha: &str) -> bool {
        self.shared
            .deployment
            .lock()
            .nodes
            .get(addr)
            .is_some_and(|n| n.scripts.contains_key(sha))
    }

    /// Empties the script cache of `addr`.
    pub fn flush_scripts(&self, addr: &NodeAddr) {
        if let Some(node) = self.shared.deployment.lock().nodes.get_mut(addr) {
            node.scripts.clear();
        }
    }

    fn primary(&self, deployment: &Deployment) -> Option<NodeAddr> {
        deployment
            .nodes
            .iter()
            .find(|(_, n)| n.up && n.role == Role::Primary)
            .map(|(addr, _)| addr.clone())
    }
}

/// Opens sessions against a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
    target: Option<NodeAddr>,
    password: Option<String>,
}

impl MemoryConnector {
    /// Presents `password` when connecting.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    fn resolve(&self) -> StoreResult<(NodeAddr, Duration)> {
        let deployment = self.store.shared.deployment.lock();
        let addr = match (&self.target, deployment.kind) {
            (Some(addr), _) => addr.clone(),
            // The supervisor hands out whichever node is primary right now.
            (None, TopologyKind::Sentinel) => self.store.primary(&deployment).ok_or_else(|| {
                StoreError::connection(ConnectionErrorKind::Refused, "no primary is available")
            })?,
            (None, _) => deployment
                .nodes
                .iter()
                .find(|(_, n)| n.up)
                .or_else(|| deployment.nodes.iter().next())
                .map(|(addr, _)| addr.clone())
                .ok_or_else(|| {
                    StoreError::connection(ConnectionErrorKind::HostUnresolved, "no nodes")
                })?,
        };

        let node = deployment.nodes.get(&addr).ok_or_else(|| {
            StoreError::connection(
                ConnectionErrorKind::HostUnresolved,
                format!("failed to lookup address information: {}", addr.host),
            )
        })?;
        if !node.up {
            return Err(StoreError::connection(
                ConnectionErrorKind::Refused,
                format!("connection to {addr} refused"),
            ));
        }
        let authenticated = match &deployment.password {
            Some(required) => self.password.as_ref() == Some(required),
            None => true,
        };
        if !authenticated {
            return Err(StoreError::connection(
                ConnectionErrorKind::Authentication,
                "WRONGPASS invalid username-password pair or user is disabled.",
            ));
        }
        Ok((addr, node.connect_delay))
    }
}

impl Connector for MemoryConnector {
    fn kind(&self) -> TopologyKind {
        self.store.shared.deployment.lock().kind
    }

    fn connect(&self) -> BoxFuture<'_, StoreResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            let (node, delay) = self.resolve()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let kind = self.kind();
            let conn: Arc<dyn Connection> = Arc::new(MemoryConnection {
                shared: Arc::clone(&self.store.shared),
                node,
                kind,
                closed: AtomicBool::new(false),
            });
            Ok(conn)
        })
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    node: NodeAddr,
    kind: TopologyKind,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::connection(
                ConnectionErrorKind::Closed,
                "connection closed",
            ));
        }
        Ok(())
    }

    /// Runs `f` against the node keyed commands route to.
    fn with_routed<T>(
        &self,
        write: bool,
        f: impl FnOnce(&mut Node, Instant, &Shared) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_open()?;
        let now = Instant::now();
        let mut deployment = self.shared.deployment.lock();
        // The session itself must still be alive.
        deployment.node_mut(&self.node)?;
        let addr = deployment.route(&self.node)?.clone();
        let node = deployment.node_mut(&addr)?;
        if write && node.role == Role::Replica {
            return Err(StoreError::ReadOnly(
                "You can't write against a read only replica.".into(),
            ));
        }
        f(node, now, &self.shared)
    }

    fn with_node<T>(&self, addr: &NodeAddr, f: impl FnOnce(&mut Node) -> T) -> StoreResult<T> {
        self.check_open()?;
        let mut deployment = self.shared.deployment.lock();
        deployment.node_mut(&self.node)?;
        let target = match self.kind {
            TopologyKind::Cluster => addr,
            TopologyKind::Single | TopologyKind::Sentinel => &self.node,
        };
        deployment.node_mut(target).map(f)
    }
}

impl Connection for MemoryConnection {
    fn eval<'a>(
        &'a self,
        script: &'a Script,
        keys: &'a [String],
        args: &'a [i64],
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        Box::pin(async move {
            self.with_routed(true, |node, now, shared| {
                // EVALSHA miss falls back to EVAL, which caches the source.
                node.scripts
                    .entry(script.sha().to_string())
                    .or_insert_with(|| script.clone());
                if script.sha() != script::allocation_script().sha() {
                    return Err(StoreError::Response(
                        "ERR this store only runs the allocation script".into(),
                    ));
                }
                let [lock, sequence, shard_id] = keys else {
                    return Err(StoreError::Response(format!(
                        "ERR allocation expects 3 keys, got {}",
                        keys.len()
                    )));
                };
                let keys = KeySet {
                    lock: lock.clone(),
                    sequence: sequence.clone(),
                    shard_id: shard_id.clone(),
                };
                let mut ks = NodeKeys::new(node, now, shared.wall_origin, shared.origin);
                script::run_allocation(&mut ks, &keys, args)
            })
        })
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { self.with_routed(false, |_, _, _| Ok(())) })
    }

    fn set<'a>(&'a self, key: &'a str, value: i64) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with_routed(true, |node, _, _| {
                node.keys.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
                Ok(())
            })
        })
    }

    fn role(&self) -> BoxFuture<'_, StoreResult<Role>> {
        let node = self.node.clone();
        Box::pin(async move { self.with_node(&node, |n| n.role) })
    }

    fn primaries(&self) -> BoxFuture<'_, StoreResult<Vec<NodeAddr>>> {
        Box::pin(async move {
            self.check_open()?;
            let deployment = self.shared.deployment.lock();
            Ok(match self.kind {
                TopologyKind::Cluster => deployment
                    .nodes
                    .iter()
                    .filter(|(_, n)| n.up && n.role == Role::Primary)
                    .map(|(addr, _)| addr.clone())
                    .collect(),
                TopologyKind::Single | TopologyKind::Sentinel => vec![self.node.clone()],
            })
        })
    }

    fn script_exists<'a>(
        &'a self,
        node: &'a NodeAddr,
        sha: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move { self.with_node(node, |n| n.scripts.contains_key(sha)) })
    }

    fn script_load<'a>(
        &'a self,
        node: &'a NodeAddr,
        script: &'a Script,
    ) -> BoxFuture<'a, StoreResult<String>> {
        Box::pin(async move {
            self.with_node(node, |n| {
                n.scripts.insert(script.sha().to_string(), script.clone());
                script.sha().to_string()
            })
        })
    }

    fn topology_events(&self) -> Option<broadcast::Receiver<TopologyEvent>> {
        (self.kind == TopologyKind::Cluster).then(|| self.shared.topology.subscribe())
    }

    fn quit(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.check_open()?;
            self.closed.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn terminate(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One node's key space at a fixed instant.
struct NodeKeys<'a> {
    keys: &'a mut HashMap<String, Entry>,
    now: Instant,
    wall_origin: SystemTime,
    origin: Instant,
}

impl<'a> NodeKeys<'a> {
    fn new(node: &'a mut Node, now: Instant, wall_origin: SystemTime, origin: Instant) -> Self {
        Self {
            keys: &mut node.keys,
            now,
            wall_origin,
            origin,
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .keys
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= self.now);
        if expired {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

impl Keyspace for NodeKeys<'_> {
    fn exists(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.live(key).is_some())
    }

    fn incr_by(&mut self, key: &str, by: i64) -> StoreResult<i64> {
        let value = match self.live(key) {
            Some(entry) => {
                entry.value = entry
                    .value
                    .checked_add(by)
                    .ok_or_else(|| StoreError::Response("ERR increment would overflow".into()))?;
                entry.value
            }
            None => {
                self.keys.insert(
                    key.to_string(),
                    Entry {
                        value: by,
                        expires_at: None,
                    },
                );
                by
            }
        };
        Ok(value)
    }

    fn get_int(&mut self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self.live(key).map(|e| e.value))
    }

    fn set_int(&mut self, key: &str, value: i64, ttl: Option<Duration>) -> StoreResult<()> {
        self.keys.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| self.now + ttl),
            },
        );
        Ok(())
    }

    fn time(&mut self) -> StoreResult<(i64, i64)> {
        let now = self.wall_origin + self.now.duration_since(self.origin);
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        Ok((
            since_epoch.as_secs() as i64,
            i64::from(since_epoch.subsec_micros()),
        ))
    }
}
