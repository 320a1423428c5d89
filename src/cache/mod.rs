//! Stale-while-revalidate caching.
//!
//! - `storage`: durable key/value backends (SQLite, memory)
//! - `store`: TTL semantics on top of a backend
//! - `gate`: single-flight guard for in-flight refreshes
//! - `layer`: the orchestrator tying store, gate, network and sync together

mod gate;
mod key;
mod layer;
mod outcome;
mod storage;
mod store;

pub use gate::{GateEntry, GateToken, GateWaiter, RequestGate, Settled};
pub use key::{action_prefix, cache_key};
pub use layer::{CacheLayer, LayerSettings, Prefetch, QueryOptions};
pub use outcome::{Origin, QueryOutcome};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use store::{CacheEntry, TtlStore, DEFAULT_TTL_MINUTES};
