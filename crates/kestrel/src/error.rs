//! Error types surfaced by the allocator.
//!
//! The variants follow the failure taxonomy of the allocation protocol:
//!
//! - Configuration and authentication failures (`Authentication`,
//!   `HostUnresolved`, `Config`) are fatal and never retried.
//! - Transport failures (`ConnectionRefused`, `ConnectTimeout`) are retried by
//!   the connection manager when its reconnect predicate allows it. The
//!   default predicate does not retry refused connections.
//! - `AllocatorLocked` is a short cool-down after a sequence wraparound. The
//!   caller may retry after a few hundred milliseconds.
//! - `ShardIdOutOfRange` requires an operator to fix the stored shard ID.
//! - `Store` wraps anything else, preserving the store's own message.

use crate::{connection::ConnectionState, store::StoreError};
use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that `kestrel` can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The store rejected the configured credentials.
    #[error("Authentication failed, check the configured username and password: {0}")]
    Authentication(String),

    /// The store host name could not be resolved.
    #[error("Could not resolve store host: {0}")]
    HostUnresolved(String),

    /// The store actively refused the connection.
    #[error("Connection refused by store: {0}")]
    ConnectionRefused(String),

    /// Establishing the connection took longer than the configured timeout.
    #[error("Timed out after {0:?} connecting to store")]
    ConnectTimeout(Duration),

    /// The sequence counter just wrapped and the allocation lock is active.
    #[error("Allocator is cooling down after a sequence wraparound, retry shortly")]
    AllocatorLocked,

    /// The logical shard ID stored on the node is missing or outside
    /// `[1, 1023]`.
    #[error("Logical shard ID is missing or outside the valid range [1, 1023]")]
    ShardIdOutOfRange,

    /// Unclassified store failure. The original message is preserved.
    #[error("Store error: {0}")]
    Store(String),

    /// No ready connection is available.
    #[error("Client is not ready (state: {0})")]
    NotReady(ConnectionState),

    /// The client has been closed.
    #[error("Client is closed")]
    Closed,

    /// A configuration value was missing or malformed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A value could not be interpreted as a Kestrel ID.
    #[error("Invalid ID: {0}")]
    InvalidId(String),
}

impl Error {
    /// Returns `true` if retrying the same request shortly may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllocatorLocked | Self::ConnectTimeout(_) | Self::NotReady(_)
        )
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        use crate::store::ConnectionErrorKind as Kind;
        match err {
            StoreError::Connection { kind, message } => match kind {
                Kind::Authentication => Self::Authentication(message),
                Kind::HostUnresolved => Self::HostUnresolved(message),
                Kind::Refused => Self::ConnectionRefused(message),
                Kind::Timeout => Self::Store(format!("timed out: {message}")),
                Kind::Closed | Kind::Io => Self::Store(message),
            },
            StoreError::AllocatorLocked => Self::AllocatorLocked,
            StoreError::ShardIdOutOfRange => Self::ShardIdOutOfRange,
            StoreError::ReadOnly(message)
            | StoreError::NoScript(message)
            | StoreError::Response(message) => Self::Store(message),
        }
    }
}
