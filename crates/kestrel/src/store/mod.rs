//! The shared key-value store, seen as a black box.
//!
//! The allocator needs very little from the store: atomic script execution,
//! `SET`, script cache introspection, replication role, cluster membership and
//! a way to close the session. [`Connector`] and [`Connection`] capture exactly
//! that surface so the protocol can run against Redis (feature `redis`) or the
//! in-process [`MemoryStore`].

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::*;
#[cfg(feature = "redis")]
pub use self::redis::*;

use crate::{Error, Result, script::Script};
use core::{fmt, str::FromStr};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::broadcast;

pub type StoreResult<T> = core::result::Result<T, StoreError>;

/// Why a connection could not be established or was lost.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionErrorKind {
    /// Bad username or password.
    Authentication,
    /// The host name did not resolve.
    HostUnresolved,
    /// The host actively refused the connection.
    Refused,
    /// The connection or handshake timed out.
    Timeout,
    /// The connection was closed underneath us.
    Closed,
    /// Any other I/O failure.
    Io,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "authentication failed",
            Self::HostUnresolved => "host unresolved",
            Self::Refused => "connection refused",
            Self::Timeout => "timed out",
            Self::Closed => "connection closed",
            Self::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// A failure reported by a store backend.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transport-level failure.
    #[error("{kind}: {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },

    /// The node is a replica and refused a write.
    #[error("READONLY {0}")]
    ReadOnly(String),

    /// The node does not have the requested script cached.
    #[error("NOSCRIPT {0}")]
    NoScript(String),

    /// The allocation lock is set; a wraparound just happened.
    #[error("{}", crate::script::LOCKED_CODE)]
    AllocatorLocked,

    /// The stored shard ID is missing or out of range.
    #[error("{}", crate::script::SHARD_RANGE_CODE)]
    ShardIdOutOfRange,

    /// Any other error reply.
    #[error("{0}")]
    Response(String),
}

impl StoreError {
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Returns the connection failure kind, if this is a transport error.
    pub const fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Self::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Transport errors invalidate the session; everything else is a reply
    /// from a healthy node.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ReadOnly(_))
    }

    /// Classifies an error reply by its leading code.
    pub fn from_reply(message: &str) -> Self {
        let message = message.trim_start_matches('-').trim();
        let code = message.split_whitespace().next().unwrap_or_default();
        let detail = message[code.len()..].trim().to_string();
        match code {
            crate::script::LOCKED_CODE => Self::AllocatorLocked,
            crate::script::SHARD_RANGE_CODE => Self::ShardIdOutOfRange,
            "READONLY" => Self::ReadOnly(detail),
            "NOSCRIPT" => Self::NoScript(detail),
            "NOAUTH" | "WRONGPASS" => {
                Self::connection(ConnectionErrorKind::Authentication, message)
            }
            _ => Self::Response(message.to_string()),
        }
    }

    /// Classifies a transport failure from its message text.
    pub fn from_io_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if lower.contains("failed to lookup address")
            || lower.contains("name or service not known")
            || lower.contains("nodename nor servname")
            || lower.contains("no such host")
            || lower.contains("enotfound")
        {
            ConnectionErrorKind::HostUnresolved
        } else if lower.contains("refused") {
            ConnectionErrorKind::Refused
        } else if lower.contains("wrongpass")
            || lower.contains("noauth")
            || lower.contains("invalid password")
            || lower.contains("authentication")
        {
            ConnectionErrorKind::Authentication
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ConnectionErrorKind::Timeout
        } else if lower.contains("broken pipe")
            || lower.contains("reset by peer")
            || lower.contains("connection closed")
            || lower.contains("dropped")
        {
            ConnectionErrorKind::Closed
        } else {
            ConnectionErrorKind::Io
        };
        Self::Connection { kind, message }
    }
}

/// Address of one store node.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("{s:?} is not in host:port form")))?;
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("{s:?} has an invalid port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("{s:?} has an empty host")));
        }
        Ok(Self::new(host, port))
    }
}

/// Deployment shape of the store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// One node (or a fixed endpoint).
    Single,
    /// Several coordinated nodes sharing the key space.
    Cluster,
    /// Primary/replica with a supervisor that promotes replicas on failure.
    Sentinel,
}

/// Replication role of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    /// Parses the `role:` line of an `INFO replication` reply.
    pub fn from_info(info: &str) -> Option<Self> {
        info.lines()
            .find_map(|line| line.trim().strip_prefix("role:"))
            .and_then(|role| match role.trim() {
                "master" => Some(Self::Primary),
                "slave" | "replica" => Some(Self::Replica),
                _ => None,
            })
    }
}

/// A cluster membership change.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TopologyEvent {
    NodeAdded(NodeAddr),
    NodeRemoved(NodeAddr),
}

/// Opens sessions against a store deployment.
pub trait Connector: Send + Sync + 'static {
    /// The deployment shape this connector targets.
    fn kind(&self) -> TopologyKind;

    /// Opens a new session. For supervised deployments this resolves the
    /// current primary first.
    fn connect(&self) -> BoxFuture<'_, StoreResult<Arc<dyn Connection>>>;
}

/// One live session with the store.
///
/// For single and supervised deployments every method targets the connected
/// node and the `node` arguments are informational. For clusters, keyed
/// commands are routed by key and the `node` arguments select the node.
pub trait Connection: Send + Sync + 'static {
    /// Runs `script` atomically, by hash first and by source if the node does
    /// not have it cached.
    fn eval<'a>(
        &'a self,
        script: &'a Script,
        keys: &'a [String],
        args: &'a [i64],
    ) -> BoxFuture<'a, StoreResult<Vec<i64>>>;

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>>;

    fn set<'a>(&'a self, key: &'a str, value: i64) -> BoxFuture<'a, StoreResult<()>>;

    /// Replication role of the connected node.
    fn role(&self) -> BoxFuture<'_, StoreResult<Role>>;

    /// Primary nodes that can originate allocations.
    fn primaries(&self) -> BoxFuture<'_, StoreResult<Vec<NodeAddr>>>;

    fn script_exists<'a>(
        &'a self,
        node: &'a NodeAddr,
        sha: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>>;

    /// Uploads `script` to `node` and returns the hash the node reports.
    fn script_load<'a>(
        &'a self,
        node: &'a NodeAddr,
        script: &'a Script,
    ) -> BoxFuture<'a, StoreResult<String>>;

    /// Membership changes, for cluster sessions only.
    fn topology_events(&self) -> Option<broadcast::Receiver<TopologyEvent>>;

    /// Politely ends the session.
    fn quit(&self) -> BoxFuture<'_, StoreResult<()>>;

    /// Drops the session immediately. Must be safe to call more than once.
    fn terminate(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_replies() {
        assert_eq!(
            StoreError::from_reply("ALLOCATOR_LOCKED sequence wraparound in progress"),
            StoreError::AllocatorLocked
        );
        assert_eq!(
            StoreError::from_reply("-SHARD_ID_OUT_OF_RANGE must be within [1, 1023]"),
            StoreError::ShardIdOutOfRange
        );
        assert_eq!(
            StoreError::from_reply("READONLY You can't write against a read only replica."),
            StoreError::ReadOnly("You can't write against a read only replica.".into())
        );
        assert!(matches!(
            StoreError::from_reply("NOSCRIPT No matching script."),
            StoreError::NoScript(_)
        ));
        assert_eq!(
            StoreError::from_reply("WRONGPASS invalid username-password pair").connection_kind(),
            Some(ConnectionErrorKind::Authentication)
        );
        assert_eq!(
            StoreError::from_reply("ERR unknown command"),
            StoreError::Response("ERR unknown command".into())
        );
    }

    #[test]
    fn classifies_io_messages() {
        let kind = |m: &str| StoreError::from_io_message(m).connection_kind();
        assert_eq!(
            kind("failed to lookup address information: Name or service not known"),
            Some(ConnectionErrorKind::HostUnresolved)
        );
        assert_eq!(
            kind("Connection refused (os error 111)"),
            Some(ConnectionErrorKind::Refused)
        );
        assert_eq!(kind("Broken pipe"), Some(ConnectionErrorKind::Closed));
        assert_eq!(kind("something else"), Some(ConnectionErrorKind::Io));
    }

    #[test]
    fn transport_errors_are_flagged() {
        assert!(StoreError::ReadOnly(String::new()).is_transport());
        assert!(StoreError::connection(ConnectionErrorKind::Closed, "gone").is_transport());
        assert!(!StoreError::AllocatorLocked.is_transport());
        assert!(!StoreError::Response("ERR".into()).is_transport());
    }

    #[test]
    fn parses_node_addresses() {
        let addr: NodeAddr = "10.0.0.5:7001".parse().unwrap();
        assert_eq!(addr, NodeAddr::new("10.0.0.5", 7001));
        assert_eq!(addr.to_string(), "10.0.0.5:7001");
        assert!("nohost".parse::<NodeAddr>().is_err());
        assert!(":6379".parse::<NodeAddr>().is_err());
        assert!("host:notaport".parse::<NodeAddr>().is_err());
    }

    #[test]
    fn reads_role_from_info() {
        let info = "# Replication\r\nrole:master\r\nconnected_slaves:1\r\n";
        assert_eq!(Role::from_info(info), Some(Role::Primary));
        assert_eq!(Role::from_info("role:slave\r\n"), Some(Role::Replica));
        assert_eq!(Role::from_info("nothing here"), None);
    }
}
