use super::{
    Connection, ConnectionErrorKind, Connector, NodeAddr, Role, StoreError, StoreResult,
    TopologyEvent, TopologyKind,
};
use crate::{
    Error, Result,
    config::{Config, Topology},
    script::Script,
};
use core::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use redis::{
    Client, ConnectionInfo, ErrorKind, FromRedisValue, IntoConnectionInfo, RedisConnectionInfo,
    RedisError, aio::MultiplexedConnection, cluster::ClusterClient,
    cluster_async::ClusterConnection,
};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// How often cluster membership is re-read.
const CLUSTER_POLL_INTERVAL: Duration = Duration::from_secs(5);

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::AuthenticationFailed {
            return Self::connection(ConnectionErrorKind::Authentication, err.to_string());
        }
        if err.is_timeout() {
            return Self::connection(ConnectionErrorKind::Timeout, err.to_string());
        }
        if err.is_connection_refusal() || err.is_io_error() {
            return Self::from_io_message(err.to_string());
        }
        if err.is_connection_dropped() {
            return Self::connection(ConnectionErrorKind::Closed, err.to_string());
        }
        match err.kind() {
            ErrorKind::ReadOnly => Self::ReadOnly(err.detail().unwrap_or_default().to_string()),
            ErrorKind::NoScriptError => Self::NoScript(err.detail().unwrap_or_default().to_string()),
            _ => match err.code() {
                Some(code) => Self::from_reply(&format!(
                    "{code} {}",
                    err.detail().unwrap_or_default()
                )),
                None => Self::Response(err.to_string()),
            },
        }
    }
}

fn connection_info(addr: &NodeAddr, redis: &RedisConnectionInfo) -> StoreResult<ConnectionInfo> {
    let mut info = (addr.host.as_str(), addr.port).into_connection_info()?;
    info.redis = redis.clone();
    Ok(info)
}

/// Fails with a timeout error if `fut` does not finish within `limit`.
async fn within<T>(
    limit: Duration,
    addr: &NodeAddr,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        StoreError::connection(
            ConnectionErrorKind::Timeout,
            format!("{addr} did not answer within {limit:?}"),
        )
    })?
}

async fn open(
    addr: &NodeAddr,
    redis: &RedisConnectionInfo,
    limit: Duration,
) -> StoreResult<MultiplexedConnection> {
    let client = Client::open(connection_info(addr, redis)?)?;
    within(limit, addr, async {
        Ok(client.get_multiplexed_async_connection().await?)
    })
    .await
}

/// Opens sessions against Redis.
///
/// - Single node: one multiplexed connection.
/// - Cluster: an async cluster connection, plus a background task that
///   re-reads `CLUSTER NODES` and publishes primaries joining or leaving.
/// - Sentinel: each sentinel is asked for the current primary of the
///   configured master until one answers; the session then targets that
///   primary directly.
#[derive(Clone, Debug)]
pub struct RedisConnector {
    topology: Topology,
    redis: RedisConnectionInfo,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a cluster with a non-zero database.
    pub fn new(config: &Config) -> Result<Self> {
        if matches!(config.topology, Topology::Cluster(_)) && config.database != 0 {
            return Err(Error::Config(
                "cluster deployments only support database 0".into(),
            ));
        }
        let mut redis = RedisConnectionInfo::default();
        redis.db = config.database;
        redis.username = config.credentials.username.clone();
        redis.password = config.credentials.password.clone();
        Ok(Self {
            topology: config.topology.clone(),
            redis,
            connect_timeout: config.connect_timeout,
        })
    }

    async fn locate_primary(&self, sentinels: &[NodeAddr], master: &str) -> StoreResult<NodeAddr> {
        let mut last_err = StoreError::connection(
            ConnectionErrorKind::HostUnresolved,
            "no sentinels configured",
        );
        // Each sentinel gets an equal share so one hung sentinel cannot
        // starve the rest.
        let share = self.connect_timeout / sentinels.len().max(1) as u32;
        for sentinel in sentinels {
            let reply: StoreResult<Option<Vec<String>>> = within(share, sentinel, async {
                let mut con = open(sentinel, &RedisConnectionInfo::default(), share).await?;
                let reply = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(master)
                    .query_async(&mut con)
                    .await?;
                Ok(reply)
            })
            .await;

            match reply {
                Ok(Some(addr)) if addr.len() == 2 => {
                    let port = addr[1].parse().map_err(|_| {
                        StoreError::Response(format!("sentinel reported port {:?}", addr[1]))
                    })?;
                    return Ok(NodeAddr::new(addr[0].clone(), port));
                }
                Ok(_) => {
                    last_err = StoreError::connection(
                        ConnectionErrorKind::HostUnresolved,
                        format!("{sentinel} does not know master {master:?}"),
                    );
                }
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%sentinel, error = %err, "Sentinel unavailable");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn connect_node(
        &self,
        node: NodeAddr,
        kind: TopologyKind,
    ) -> StoreResult<RedisConnection> {
        let con = open(&node, &self.redis, self.connect_timeout).await?;
        Ok(RedisConnection {
            handle: Mutex::new(Some(Handle::Node(con))),
            node,
            kind,
            redis: self.redis.clone(),
            connect_timeout: self.connect_timeout,
            topology: None,
            poller: CancellationToken::new(),
        })
    }

    async fn connect_cluster(&self, seeds: &[NodeAddr]) -> StoreResult<RedisConnection> {
        let infos = seeds
            .iter()
            .map(|addr| connection_info(addr, &self.redis))
            .collect::<StoreResult<Vec<_>>>()?;
        let mut builder = ClusterClient::builder(infos);
        if let Some(username) = &self.redis.username {
            builder = builder.username(username.clone());
        }
        if let Some(password) = &self.redis.password {
            builder = builder.password(password.clone());
        }
        let mut con = builder.build()?.get_async_connection().await?;

        let nodes: String = redis::cmd("CLUSTER").arg("NODES").query_async(&mut con).await?;
        let primaries = parse_cluster_primaries(&nodes);
        let (topology, _) = broadcast::channel(64);
        let poller = CancellationToken::new();
        tokio::spawn(poll_cluster(
            con.clone(),
            primaries,
            topology.clone(),
            poller.clone(),
        ));

        let node = seeds
            .first()
            .cloned()
            .ok_or_else(|| StoreError::Response("cluster has no seed nodes".into()))?;
        Ok(RedisConnection {
            handle: Mutex::new(Some(Handle::Cluster(con))),
            node,
            kind: TopologyKind::Cluster,
            redis: self.redis.clone(),
            connect_timeout: self.connect_timeout,
            topology: Some(topology),
            poller,
        })
    }
}

impl Connector for RedisConnector {
    fn kind(&self) -> TopologyKind {
        match self.topology {
            Topology::Single(_) => TopologyKind::Single,
            Topology::Cluster(_) => TopologyKind::Cluster,
            Topology::Sentinel { .. } => TopologyKind::Sentinel,
        }
    }

    fn connect(&self) -> BoxFuture<'_, StoreResult<Arc<dyn Connection>>> {
        Box::pin(async move {
            let conn = match &self.topology {
                Topology::Single(node) => {
                    self.connect_node(node.clone(), TopologyKind::Single).await?
                }
                Topology::Cluster(seeds) => self.connect_cluster(seeds).await?,
                Topology::Sentinel {
                    sentinels,
                    master_name,
                } => {
                    let primary = self.locate_primary(sentinels, master_name).await?;
                    #[cfg(feature = "tracing")]
                    tracing::info!(%primary, master = %master_name, "Sentinel reported primary");
                    self.connect_node(primary, TopologyKind::Sentinel).await?
                }
            };
            let conn: Arc<dyn Connection> = Arc::new(conn);
            Ok(conn)
        })
    }
}

#[derive(Clone)]
enum Handle {
    Node(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// A live Redis session.
pub struct RedisConnection {
    handle: Mutex<Option<Handle>>,
    node: NodeAddr,
    kind: TopologyKind,
    redis: RedisConnectionInfo,
    connect_timeout: Duration,
    topology: Option<broadcast::Sender<TopologyEvent>>,
    poller: CancellationToken,
}

impl RedisConnection {
    fn handle(&self) -> StoreResult<Handle> {
        self.handle.lock().clone().ok_or_else(|| {
            StoreError::connection(ConnectionErrorKind::Closed, "connection terminated")
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> StoreResult<T> {
        let value: T = match self.handle()? {
            Handle::Node(mut con) => cmd.query_async(&mut con).await?,
            Handle::Cluster(mut con) => cmd.query_async(&mut con).await?,
        };
        Ok(value)
    }

    /// Runs `cmd` on one specific node.
    async fn query_node<T: FromRedisValue>(
        &self,
        node: &NodeAddr,
        cmd: &redis::Cmd,
    ) -> StoreResult<T> {
        match self.kind {
            TopologyKind::Cluster => {
                within(self.connect_timeout, node, async {
                    let mut con = open(node, &self.redis, self.connect_timeout).await?;
                    Ok(cmd.query_async(&mut con).await?)
                })
                .await
            }
            TopologyKind::Single | TopologyKind::Sentinel => self.query(cmd).await,
        }
    }
}

impl Connection for RedisConnection {
    fn eval<'a>(
        &'a self,
        script: &'a Script,
        keys: &'a [String],
        args: &'a [i64],
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>> {
        Box::pin(async move {
            let mut evalsha = redis::cmd("EVALSHA");
            evalsha.arg(script.sha()).arg(keys.len()).arg(keys).arg(args);
            match self.query(&evalsha).await {
                Err(StoreError::NoScript(_)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(sha = script.sha(), "Script not cached, sending source");
                    let mut eval = redis::cmd("EVAL");
                    eval.arg(script.source()).arg(keys.len()).arg(keys).arg(args);
                    self.query(&eval).await
                }
                result => result,
            }
        })
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let _pong: String = self.query(&redis::cmd("PING")).await?;
            Ok(())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: i64) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            let _ok: String = self.query(&cmd).await?;
            Ok(())
        })
    }

    fn role(&self) -> BoxFuture<'_, StoreResult<Role>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("INFO");
            cmd.arg("replication");
            let info: String = self.query(&cmd).await?;
            Role::from_info(&info)
                .ok_or_else(|| StoreError::Response("INFO replication has no role".into()))
        })
    }

    fn primaries(&self) -> BoxFuture<'_, StoreResult<Vec<NodeAddr>>> {
        Box::pin(async move {
            match self.kind {
                TopologyKind::Cluster => {
                    let mut cmd = redis::cmd("CLUSTER");
                    cmd.arg("NODES");
                    let nodes: String = self.query(&cmd).await?;
                    Ok(parse_cluster_primaries(&nodes).into_iter().collect())
                }
                TopologyKind::Single | TopologyKind::Sentinel => Ok(vec![self.node.clone()]),
            }
        })
    }

    fn script_exists<'a>(
        &'a self,
        node: &'a NodeAddr,
        sha: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SCRIPT");
            cmd.arg("EXISTS").arg(sha);
            let exists: Vec<i64> = self.query_node(node, &cmd).await?;
            Ok(exists.first() == Some(&1))
        })
    }

    fn script_load<'a>(
        &'a self,
        node: &'a NodeAddr,
        script: &'a Script,
    ) -> BoxFuture<'a, StoreResult<String>> {
        Box::pin(async move {
            let mut cmd = redis::cmd("SCRIPT");
            cmd.arg("LOAD").arg(script.source());
            self.query_node(node, &cmd).await
        })
    }

    fn topology_events(&self) -> Option<broadcast::Receiver<TopologyEvent>> {
        self.topology.as_ref().map(broadcast::Sender::subscribe)
    }

    fn quit(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            self.poller.cancel();
            if let Handle::Node(mut con) = self.handle()? {
                // The server closes the socket right after replying.
                let _bye: StoreResult<String> = redis::cmd("QUIT")
                    .query_async(&mut con)
                    .await
                    .map_err(StoreError::from);
            }
            Ok(())
        })
    }

    fn terminate(&self) {
        self.poller.cancel();
        self.handle.lock().take();
    }
}

/// Primary addresses listed in a `CLUSTER NODES` reply.
fn parse_cluster_primaries(reply: &str) -> BTreeSet<NodeAddr> {
    reply
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _id = fields.next()?;
            let addr = fields.next()?;
            let flags = fields.next()?;
            let flags: Vec<_> = flags.split(',').collect();
            let unusable = flags
                .iter()
                .any(|f| f.starts_with("fail") || *f == "noaddr" || *f == "handshake");
            if !flags.contains(&"master") || unusable {
                return None;
            }
            // ip:port@cport[,hostname]
            let addr = addr.split(['@', ',']).next()?;
            let node: NodeAddr = addr.parse().ok()?;
            (node.port != 0).then_some(node)
        })
        .collect()
}

async fn poll_cluster(
    mut con: ClusterConnection,
    mut known: BTreeSet<NodeAddr>,
    events: broadcast::Sender<TopologyEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(CLUSTER_POLL_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let reply: core::result::Result<String, RedisError> =
            redis::cmd("CLUSTER").arg("NODES").query_async(&mut con).await;
        let current = match reply {
            Ok(reply) => parse_cluster_primaries(&reply),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Failed to read cluster membership");
                continue;
            }
        };

        for added in current.difference(&known) {
            let _ = events.send(TopologyEvent::NodeAdded(added.clone()));
        }
        for removed in known.difference(&current) {
            let _ = events.send(TopologyEvent::NodeRemoved(removed.clone()));
        }
        known = current;
    }
}
