//! Stale-while-revalidate query cache with cross-context change notification.
//!
//! Queries are answered from a TTL store first and refreshed from the network
//! in the background. Concurrent refreshes of one query share a single
//! network call, and contexts sharing a storage origin tell each other when
//! data changed so they can re-read the cache.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod query;
pub mod sync;

pub use cache::{CacheLayer, Origin, QueryOptions, QueryOutcome, TtlStore};
pub use context::Context;
pub use error::{CallError, QueryError};
pub use query::{LiveQuery, QueryState};
pub use sync::{SyncBroadcaster, SyncSignal};
