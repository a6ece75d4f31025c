//! Distributed, time-sortable 64-bit IDs.
//!
//! Every process shares one Redis-compatible store. Each call to
//! [`Kestrel::issue`] runs a single atomic script on the store that reserves a
//! block of sequence numbers and reports the store's clock and logical shard
//! ID. The client packs those into [`KestrelId`]s locally.
//!
//! ```text
//! [reserved:1][timestamp:41][shard:10][sequence:12]
//! ```
//!
//! Optional features:
//!
//! - `redis`: the Redis backend ([`RedisConnector`], [`Kestrel::connect`]).
//! - `tracing`: structured logging through the `tracing` crate.
//! - `serde`: `Serialize`/`Deserialize` for IDs, decoded IDs and topology.
//!
//! Without `redis`, the full protocol runs against the in-process
//! [`MemoryStore`].

mod client;
mod config;
mod connection;
mod coordinator;
mod debounce;
mod error;
mod events;
mod id;
mod script;
mod store;
mod time;

pub use crate::client::*;
pub use crate::config::*;
pub use crate::connection::*;
pub use crate::coordinator::*;
pub use crate::debounce::*;
pub use crate::error::*;
pub use crate::events::*;
pub use crate::id::*;
pub use crate::script::*;
pub use crate::store::*;
pub use crate::time::*;
