//! Stale-while-revalidate orchestration over the TTL store and a network caller.

use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::gate::{GateEntry, RequestGate};
use super::key::{action_prefix, cache_key};
use super::outcome::{Origin, QueryOutcome};
use super::store::{TtlStore, DEFAULT_TTL_MINUTES};
use crate::api::NetworkCaller;
use crate::error::QueryError;
use crate::sync::SyncBroadcaster;

/// Tunables shared by every query of one layer.
#[derive(Debug, Clone)]
pub struct LayerSettings {
  pub default_ttl_minutes: u32,
  /// TTL per action name; cheap, slow-changing data gets longer TTLs.
  pub ttl_by_action: BTreeMap<String, u32>,
  /// Sync signal published when an action's data changes.
  pub signal_by_action: BTreeMap<String, String>,
  /// Upper bound on one network call. Keeps the gate from being held forever.
  pub request_timeout: Option<Duration>,
  /// Upper bound on waiting for another caller's in-flight request.
  pub gate_wait: Option<Duration>,
}

impl Default for LayerSettings {
  fn default() -> Self {
    let ttl_by_action = [
      ("listarClientes", 60),
      ("listarProcessos", 10),
      ("getDashboard", 5),
    ]
    .into_iter()
    .map(|(action, ttl)| (action.to_string(), ttl))
    .collect();

    let signal_by_action = [
      ("listarClientes", "clients-updated"),
      ("listarProcessos", "cases-updated"),
      ("getDashboard", "dashboard-updated"),
      ("listarMovimentacoes", "movements-updated"),
    ]
    .into_iter()
    .map(|(action, signal)| (action.to_string(), signal.to_string()))
    .collect();

    Self {
      default_ttl_minutes: DEFAULT_TTL_MINUTES,
      ttl_by_action,
      signal_by_action,
      request_timeout: Some(Duration::from_secs(60)),
      gate_wait: Some(Duration::from_secs(90)),
    }
  }
}

impl LayerSettings {
  pub fn ttl_for(&self, action: &str) -> u32 {
    self
      .ttl_by_action
      .get(action)
      .copied()
      .unwrap_or(self.default_ttl_minutes)
  }

  pub fn signal_for(&self, action: &str) -> String {
    self
      .signal_by_action
      .get(action)
      .cloned()
      .unwrap_or_else(|| format!("{}-updated", action))
  }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  /// Overrides the per-action TTL.
  pub ttl_minutes: Option<u32>,
  /// Serve an expired entry as a cache hit instead of evicting it.
  pub allow_stale: bool,
  /// Never raise the busy indicator for this call.
  pub silent: bool,
  /// Refresh from the network even when a cache hit was served.
  pub revalidate: bool,
  /// Overrides the per-action sync signal.
  pub signal: Option<String>,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      ttl_minutes: None,
      allow_stale: false,
      silent: false,
      revalidate: true,
      signal: None,
    }
  }
}

impl QueryOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_ttl(mut self, minutes: u32) -> Self {
    self.ttl_minutes = Some(minutes);
    self
  }

  pub fn allowing_stale(mut self) -> Self {
    self.allow_stale = true;
    self
  }

  pub fn silenced(mut self) -> Self {
    self.silent = true;
    self
  }

  /// Serve a cache hit without revalidating it.
  pub fn cache_first(mut self) -> Self {
    self.revalidate = false;
    self
  }

  pub fn with_signal(mut self, signal: impl Into<String>) -> Self {
    self.signal = Some(signal.into());
    self
  }
}

/// A query to warm the cache with.
#[derive(Debug, Clone)]
pub struct Prefetch {
  pub action: String,
  pub params: Value,
}

impl Prefetch {
  pub fn new(action: impl Into<String>, params: Value) -> Self {
    Self {
      action: action.into(),
      params,
    }
  }
}

/// Raises the busy counter for as long as it lives.
struct BusyGuard<'a>(&'a watch::Sender<usize>);

impl<'a> BusyGuard<'a> {
  fn raise(busy: &'a watch::Sender<usize>) -> Self {
    busy.send_modify(|n| *n += 1);
    Self(busy)
  }
}

impl Drop for BusyGuard<'_> {
  fn drop(&mut self) {
    self.0.send_modify(|n| *n = n.saturating_sub(1));
  }
}

/// Stale-while-revalidate engine for one context.
///
/// Cached data is handed to the caller immediately, the network is asked for
/// fresh data in the background, and concurrent refreshes of the same key
/// collapse into one network call.
pub struct CacheLayer {
  store: TtlStore,
  caller: Arc<dyn NetworkCaller>,
  sync: SyncBroadcaster,
  gate: RequestGate,
  settings: Arc<LayerSettings>,
  busy: Arc<watch::Sender<usize>>,
}

impl CacheLayer {
  pub fn new(
    store: TtlStore,
    caller: Arc<dyn NetworkCaller>,
    sync: SyncBroadcaster,
    settings: LayerSettings,
  ) -> Self {
    let (busy, _) = watch::channel(0);
    Self {
      store,
      caller,
      sync,
      gate: RequestGate::new(),
      settings: Arc::new(settings),
      busy: Arc::new(busy),
    }
  }

  pub fn store(&self) -> &TtlStore {
    &self.store
  }

  pub fn sync(&self) -> &SyncBroadcaster {
    &self.sync
  }

  pub fn gate(&self) -> &RequestGate {
    &self.gate
  }

  pub fn settings(&self) -> &LayerSettings {
    &self.settings
  }

  /// Number of non-silent network calls in flight, for a loading indicator.
  pub fn busy(&self) -> watch::Receiver<usize> {
    self.busy.subscribe()
  }

  /// Serve `action(params)` cache-then-network.
  ///
  /// `on_result` runs at most twice: with [`Origin::Cache`] if a cache hit
  /// exists at call time, then with [`Origin::Network`] if the refresh
  /// succeeds. A failed refresh is returned as an error only when no cached
  /// data was served.
  pub async fn query<F>(
    &self,
    action: &str,
    params: &Value,
    opts: &QueryOptions,
    mut on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(&Value, Origin),
  {
    let key = cache_key(action, params);

    let cached: Option<Value> = if opts.allow_stale {
      self.store.get_stale(&key)
    } else {
      self.store.get(&key)
    };
    let hit = cached.is_some();

    if let Some(data) = &cached {
      debug!(key = %key, "cache hit");
      on_result(data, Origin::Cache);
      if !opts.revalidate {
        return Ok(QueryOutcome::CacheOnly);
      }
    } else {
      debug!(key = %key, "cache miss");
    }

    let ttl = opts
      .ttl_minutes
      .unwrap_or_else(|| self.settings.ttl_for(action));

    match self
      .fetch_shared(&key, action, params, ttl, opts.silent || hit)
      .await
    {
      Ok((data, led)) => {
        on_result(&data, Origin::Network);
        if led {
          let signal = opts
            .signal
            .clone()
            .unwrap_or_else(|| self.settings.signal_for(action));
          self.sync.publish(&signal);
        }
        Ok(QueryOutcome::Refreshed)
      }
      Err(e) if hit => {
        warn!(key = %key, error = %e, "refresh failed, keeping cached data");
        Ok(QueryOutcome::ServedStale(e))
      }
      Err(e) => Err(e),
    }
  }

  /// Drop the cached entry for `action(params)` and query again.
  pub async fn refresh<F>(
    &self,
    action: &str,
    params: &Value,
    opts: &QueryOptions,
    on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(&Value, Origin),
  {
    self.store.remove(&cache_key(action, params));
    self.query(action, params, opts, on_result).await
  }

  /// Cache-only read, used to re-hydrate after a sync signal.
  pub fn cached(&self, action: &str, params: &Value, allow_stale: bool) -> Option<Value> {
    let key = cache_key(action, params);
    if allow_stale {
      self.store.get_stale(&key)
    } else {
      self.store.get(&key)
    }
  }

  /// Forget every cached variant of `action` and tell other contexts.
  pub fn invalidate(&self, action: &str) {
    self.store.clear(Some(&action_prefix(action)));
    self.sync.publish(&self.settings.signal_for(action));
  }

  /// Uncached write call. On success every action in `invalidates` is
  /// dropped from the cache and its signal published once.
  pub async fn mutate(
    &self,
    action: &str,
    params: &Value,
    invalidates: &[&str],
  ) -> Result<Value, QueryError> {
    let data = {
      let _busy = BusyGuard::raise(&self.busy);
      self.call_network(action, action, params).await?
    };

    let mut signals = BTreeSet::new();
    for target in invalidates {
      self.store.clear(Some(&action_prefix(target)));
      signals.insert(self.settings.signal_for(target));
    }
    for signal in &signals {
      self.sync.publish(signal);
    }

    info!(action, invalidated = invalidates.len(), "mutation applied");
    Ok(data)
  }

  /// Warm the cache for several queries concurrently.
  ///
  /// Failures are logged and skipped. Returns how many queries refreshed.
  pub async fn prefetch(&self, queries: &[Prefetch]) -> usize {
    let opts = QueryOptions::new().silenced();

    let results = join_all(
      queries
        .iter()
        .map(|q| self.query(&q.action, &q.params, &opts, |_, _| {})),
    )
    .await;

    let mut refreshed = 0;
    for (query, result) in queries.iter().zip(results) {
      match result {
        Ok(QueryOutcome::Refreshed) => refreshed += 1,
        Ok(_) => {}
        Err(e) => warn!(action = %query.action, error = %e, "prefetch failed"),
      }
    }

    debug!(refreshed, total = queries.len(), "prefetch finished");
    refreshed
  }

  /// Refresh `key` from the network, sharing any in-flight call for it.
  ///
  /// Returns the payload and whether this caller performed the call.
  async fn fetch_shared(
    &self,
    key: &str,
    action: &str,
    params: &Value,
    ttl_minutes: u32,
    silent: bool,
  ) -> Result<(Value, bool), QueryError> {
    match self.gate.try_enter(key) {
      GateEntry::Busy(waiter) => {
        debug!(key, "joining in-flight request");
        let data = waiter.wait(self.settings.gate_wait).await?;
        Ok((data, false))
      }
      GateEntry::Leader(token) => {
        let outcome = {
          let _busy = (!silent).then(|| BusyGuard::raise(&self.busy));
          self.call_network(key, action, params).await
        };

        if let Ok(data) = &outcome {
          self.store.set(key, data, ttl_minutes);
        }
        token.leave(outcome.clone());

        outcome.map(|data| (data, true))
      }
    }
  }

  async fn call_network(
    &self,
    key: &str,
    action: &str,
    params: &Value,
  ) -> Result<Value, QueryError> {
    let call = self.caller.call(action, params);

    match self.settings.request_timeout {
      Some(limit) => match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(QueryError::from),
        Err(_) => Err(QueryError::Timeout {
          key: key.to_string(),
          waited_ms: limit.as_millis() as u64,
        }),
      },
      None => call.await.map_err(QueryError::from),
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      caller: Arc::clone(&self.caller),
      sync: self.sync.clone(),
      gate: self.gate.clone(),
      settings: Arc::clone(&self.settings),
      busy: Arc::clone(&self.busy),
    }
  }
}
