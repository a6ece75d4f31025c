//! Client configuration.
//!
//! Every setting is resolved once, when [`ConfigBuilder::build`] runs, in this
//! order: the value set on the builder, then the matching environment
//! variable, then the built-in default.
//!
//! | Setting | Environment variable | Default |
//! |---|---|---|
//! | single node host | `KESTREL_HOST` | `127.0.0.1` |
//! | single node port | `KESTREL_PORT` | `6379` |
//! | cluster nodes (`host:port,...`) | `KESTREL_CLUSTER_NODES` | none |
//! | sentinels (`host:port,...`) | `KESTREL_SENTINELS` | none |
//! | sentinel master name | `KESTREL_SENTINEL_MASTER` | `mymaster` |
//! | username | `KESTREL_USERNAME` | none |
//! | password | `KESTREL_PASSWORD` | none |
//! | database index | `KESTREL_DATABASE` | `0` |
//! | logical shard ID | `KESTREL_SHARD_ID` | `1` |
//! | connect timeout (ms) | `KESTREL_CONNECT_TIMEOUT_MS` | `10000` |
//!
//! When both cluster nodes and sentinels are present in the environment, the
//! cluster wins.

use crate::{
    Error, Result,
    store::{ConnectionErrorKind, NodeAddr, StoreError},
};
use core::{fmt, str::FromStr, time::Duration};
use std::sync::Arc;

pub const ENV_HOST: &str = "KESTREL_HOST";
pub const ENV_PORT: &str = "KESTREL_PORT";
pub const ENV_CLUSTER_NODES: &str = "KESTREL_CLUSTER_NODES";
pub const ENV_SENTINELS: &str = "KESTREL_SENTINELS";
pub const ENV_SENTINEL_MASTER: &str = "KESTREL_SENTINEL_MASTER";
pub const ENV_USERNAME: &str = "KESTREL_USERNAME";
pub const ENV_PASSWORD: &str = "KESTREL_PASSWORD";
pub const ENV_DATABASE: &str = "KESTREL_DATABASE";
pub const ENV_SHARD_ID: &str = "KESTREL_SHARD_ID";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "KESTREL_CONNECT_TIMEOUT_MS";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_SENTINEL_MASTER: &str = "mymaster";
pub const DEFAULT_SHARD_ID: u16 = 1;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the store lives.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Topology {
    /// One node.
    Single(NodeAddr),
    /// A cluster, reached through any of its seed nodes.
    Cluster(Vec<NodeAddr>),
    /// A supervised primary, located by asking the sentinels.
    Sentinel {
        sentinels: Vec<NodeAddr>,
        master_name: String,
    },
}

/// Username and password presented to the store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Maps a reconnect attempt (starting at 1) to a delay, or `None` to stop.
pub type BackoffFn = Arc<dyn Fn(u32) -> Option<Duration> + Send + Sync>;

/// Decides whether a transport error is worth reconnecting for.
pub type ReconnectPredicate = Arc<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// Reconnect behavior after a transport failure.
#[derive(Clone)]
pub struct ReconnectPolicy {
    backoff: BackoffFn,
    reconnect_on_error: ReconnectPredicate,
}

impl ReconnectPolicy {
    pub const DEFAULT_STEP: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

    pub fn new(backoff: BackoffFn, reconnect_on_error: ReconnectPredicate) -> Self {
        Self {
            backoff,
            reconnect_on_error,
        }
    }

    /// Linear backoff: `attempt * step`, capped at `max_delay`, stopping
    /// after `max_attempts`.
    pub fn linear(step: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self::new(
            Arc::new(move |attempt| {
                (attempt <= max_attempts).then(|| step.saturating_mul(attempt).min(max_delay))
            }),
            Arc::new(default_reconnect_on_error),
        )
    }

    pub fn with_backoff(
        mut self,
        backoff: impl Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_reconnect_on_error(
        mut self,
        predicate: impl Fn(&StoreError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_on_error = Arc::new(predicate);
        self
    }

    /// Delay before reconnect `attempt`, or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (self.backoff)(attempt)
    }

    pub fn should_reconnect(&self, err: &StoreError) -> bool {
        (self.reconnect_on_error)(err)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::linear(
            Self::DEFAULT_STEP,
            Self::DEFAULT_MAX_DELAY,
            Self::DEFAULT_MAX_ATTEMPTS,
        )
    }
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy").finish_non_exhaustive()
    }
}

/// Reconnecting cannot fix bad credentials or a host that does not exist or
/// refuses connections. Everything else is retried.
pub fn default_reconnect_on_error(err: &StoreError) -> bool {
    !matches!(
        err.connection_kind(),
        Some(
            ConnectionErrorKind::Authentication
                | ConnectionErrorKind::HostUnresolved
                | ConnectionErrorKind::Refused
        )
    )
}

/// Fully resolved client configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub topology: Topology,
    pub credentials: Credentials,
    pub database: i64,
    /// Logical shard ID written to every primary. The store rejects
    /// allocations unless it is within `[1, 1023]`.
    pub shard_id: u16,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Resolves every setting from the environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an environment value is malformed.
    pub fn from_env() -> Result<Self> {
        ConfigBuilder::default().build()
    }
}

/// Builder for [`Config`].
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    topology: Option<Topology>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    database: Option<i64>,
    shard_id: Option<u16>,
    connect_timeout: Option<Duration>,
    reconnect: Option<ReconnectPolicy>,
}

impl ConfigBuilder {
    /// Connects to a single node at `host:port`.
    pub fn node(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    pub fn shard_id(mut self, shard_id: u16) -> Self {
        self.shard_id = Some(shard_id);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Resolves the configuration against the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is malformed or the combination
    /// is invalid.
    pub fn build(self) -> Result<Config> {
        self.build_with(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration against `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is malformed or the combination
    /// is invalid.
    pub fn build_with(self, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let topology = match self.topology {
            Some(topology) => topology,
            None => match (env(ENV_CLUSTER_NODES), env(ENV_SENTINELS)) {
                (Some(nodes), _) => Topology::Cluster(parse_nodes(ENV_CLUSTER_NODES, &nodes)?),
                (None, Some(sentinels)) => Topology::Sentinel {
                    sentinels: parse_nodes(ENV_SENTINELS, &sentinels)?,
                    master_name: env(ENV_SENTINEL_MASTER)
                        .unwrap_or_else(|| DEFAULT_SENTINEL_MASTER.to_string()),
                },
                (None, None) => {
                    let host = self
                        .host
                        .or_else(|| env(ENV_HOST))
                        .unwrap_or_else(|| DEFAULT_HOST.to_string());
                    let port = match self.port {
                        Some(port) => port,
                        None => parse_env(ENV_PORT, env(ENV_PORT))?.unwrap_or(DEFAULT_PORT),
                    };
                    Topology::Single(NodeAddr::new(host, port))
                }
            },
        };

        let database = match self.database {
            Some(db) => db,
            None => parse_env(ENV_DATABASE, env(ENV_DATABASE))?.unwrap_or(0),
        };
        let shard_id = match self.shard_id {
            Some(id) => id,
            None => parse_env(ENV_SHARD_ID, env(ENV_SHARD_ID))?.unwrap_or(DEFAULT_SHARD_ID),
        };
        let connect_timeout = match self.connect_timeout {
            Some(timeout) => timeout,
            None => parse_env(ENV_CONNECT_TIMEOUT_MS, env(ENV_CONNECT_TIMEOUT_MS))?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        };

        let config = Config {
            topology,
            credentials: Credentials {
                username: self.username.or_else(|| env(ENV_USERNAME)),
                password: self.password.or_else(|| env(ENV_PASSWORD)),
            },
            database,
            shard_id,
            connect_timeout,
            reconnect: self.reconnect.unwrap_or_default(),
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<()> {
    match &config.topology {
        Topology::Cluster(nodes) if nodes.is_empty() => {
            return Err(Error::Config("cluster needs at least one node".into()));
        }
        Topology::Cluster(_) if config.database != 0 => {
            return Err(Error::Config(
                "cluster deployments only support database 0".into(),
            ));
        }
        Topology::Sentinel { sentinels, .. } if sentinels.is_empty() => {
            return Err(Error::Config("sentinel needs at least one node".into()));
        }
        Topology::Sentinel { master_name, .. } if master_name.is_empty() => {
            return Err(Error::Config("sentinel master name is empty".into()));
        }
        _ => {}
    }
    if config.database < 0 {
        return Err(Error::Config(format!(
            "database index {} is negative",
            config.database
        )));
    }
    if config.connect_timeout.is_zero() {
        return Err(Error::Config("connect timeout must be positive".into()));
    }
    Ok(())
}

fn parse_env<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key}={v:?} is not valid")))
        })
        .transpose()
}

fn parse_nodes(key: &str, value: &str) -> Result<Vec<NodeAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e: Error| Error::Config(format!("{key}: {e}")))
        })
        .collect()
}
