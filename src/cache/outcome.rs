//! Types describing where query data came from and how a refresh ended.

use std::fmt;

use crate::error::QueryError;

/// Where a payload handed to a result callback came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
  /// Read from the TTL store at call time
  Cache,
  /// Fresh from the network caller
  Network,
}

impl fmt::Display for Origin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Origin::Cache => f.write_str("cache"),
      Origin::Network => f.write_str("network"),
    }
  }
}

/// How a successful [`crate::cache::CacheLayer::query`] call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
  /// Network data was delivered (after cached data, if any).
  Refreshed,
  /// Cached data was delivered and revalidation was skipped.
  CacheOnly,
  /// Cached data was delivered; the refresh failed and was absorbed.
  ServedStale(QueryError),
}

impl QueryOutcome {
  pub fn is_refreshed(&self) -> bool {
    matches!(self, QueryOutcome::Refreshed)
  }
}
