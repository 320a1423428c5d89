//! Live, pollable view over one cached query.
//!
//! A `LiveQuery` runs [`CacheLayer::query`] on a background task and feeds
//! the results back through a channel, so a UI loop can call [`LiveQuery::poll`]
//! on every tick and re-render when it returns `true`.
//!
//! # Example
//!
//! ```ignore
//! let mut clients = LiveQuery::new(layer.clone(), "listarClientes", json!({}), opts);
//! clients.follow("clients-updated");
//! clients.fetch();
//!
//! // In event loop tick
//! if clients.poll() {
//!     render(clients.state());
//! }
//! ```
//!
//! Every fetch is tagged with a generation number. Starting a new fetch
//! (a new search term, another click on refresh) bumps the generation, and
//! results still arriving for older generations are dropped at poll time.
//! The older network call itself keeps running and still fills the cache.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{CacheLayer, Origin, QueryOptions, QueryOutcome};
use crate::error::QueryError;
use crate::sync::SubscriptionId;

/// The state of a live query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState {
  /// Query has not been started
  Idle,
  /// First fetch in progress, nothing to show yet
  Loading,
  /// Data available, from cache or network
  Ready { data: Value, origin: Origin },
  /// No data could be loaded
  Error(QueryError),
}

impl QueryState {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn data(&self) -> Option<&Value> {
    match self {
      QueryState::Ready { data, .. } => Some(data),
      _ => None,
    }
  }

  pub fn origin(&self) -> Option<Origin> {
    match self {
      QueryState::Ready { origin, .. } => Some(*origin),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&QueryError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Monotonic counter identifying the newest fetch.
#[derive(Debug, Default)]
pub struct Generation(AtomicU64);

impl Generation {
  pub fn current(&self) -> u64 {
    self.0.load(Ordering::SeqCst)
  }

  /// Start a new generation and return it.
  pub fn advance(&self) -> u64 {
    self.0.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn is_current(&self, generation: u64) -> bool {
    self.current() == generation
  }
}

#[derive(Debug)]
enum Update {
  Data(Value, Origin),
  Failed(QueryError),
  Settled(QueryOutcome),
}

pub struct LiveQuery {
  layer: CacheLayer,
  action: String,
  params: Value,
  opts: QueryOptions,
  state: QueryState,
  generation: Generation,
  fetching: bool,
  /// Refresh failure absorbed while cached data stayed on screen.
  warning: Option<QueryError>,
  tx: mpsc::UnboundedSender<(u64, Update)>,
  rx: mpsc::UnboundedReceiver<(u64, Update)>,
  dirty: Arc<AtomicBool>,
  subscriptions: Vec<SubscriptionId>,
}

impl LiveQuery {
  pub fn new(
    layer: CacheLayer,
    action: impl Into<String>,
    params: Value,
    opts: QueryOptions,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      layer,
      action: action.into(),
      params,
      opts,
      state: QueryState::Idle,
      generation: Generation::default(),
      fetching: false,
      warning: None,
      tx,
      rx,
      dirty: Arc::new(AtomicBool::new(false)),
      subscriptions: Vec::new(),
    }
  }

  pub fn state(&self) -> &QueryState {
    &self.state
  }

  pub fn params(&self) -> &Value {
    &self.params
  }

  /// Whether a fetch of the current generation is still running.
  pub fn is_fetching(&self) -> bool {
    self.fetching
  }

  pub fn warning(&self) -> Option<&QueryError> {
    self.warning.as_ref()
  }

  pub fn generation(&self) -> u64 {
    self.generation.current()
  }

  /// Start fetching unless a fetch is already running.
  pub fn fetch(&mut self) {
    if self.fetching {
      return;
    }
    self.start_fetch();
  }

  /// Start a new fetch, superseding any running one.
  pub fn refetch(&mut self) {
    self.start_fetch();
  }

  /// Switch to new parameters (e.g. a new search term) and refetch.
  pub fn set_params(&mut self, params: Value) {
    self.params = params;
    self.start_fetch();
  }

  /// Re-read the cache when another context publishes `signal`.
  ///
  /// The re-read happens on the next [`LiveQuery::poll`]; it never touches
  /// the network.
  pub fn follow(&mut self, signal: &str) {
    let dirty = Arc::clone(&self.dirty);
    let id = self.layer.sync().subscribe(signal, move |_| {
      dirty.store(true, Ordering::SeqCst);
    });
    self.subscriptions.push(id);
  }

  /// Replace the displayed data with what the cache holds now.
  ///
  /// Returns `true` if the state changed.
  pub fn rehydrate(&mut self) -> bool {
    let Some(data) = self
      .layer
      .cached(&self.action, &self.params, self.opts.allow_stale)
    else {
      return false;
    };

    if self.state.data() == Some(&data) {
      return false;
    }

    self.state = QueryState::Ready {
      data,
      origin: Origin::Cache,
    };
    true
  }

  /// Apply results that arrived since the last poll.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if self.dirty.swap(false, Ordering::SeqCst) {
      changed |= self.rehydrate();
    }

    while let Ok((generation, update)) = self.rx.try_recv() {
      if !self.generation.is_current(generation) {
        // Superseded by a newer fetch
        continue;
      }

      match update {
        Update::Data(data, origin) => {
          self.state = QueryState::Ready { data, origin };
        }
        Update::Failed(error) => {
          self.state = QueryState::Error(error);
          self.fetching = false;
        }
        Update::Settled(outcome) => {
          self.warning = match outcome {
            QueryOutcome::ServedStale(error) => Some(error),
            _ => None,
          };
          self.fetching = false;
        }
      }
      changed = true;
    }

    changed
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let generation = self.generation.advance();
    self.fetching = true;
    if !matches!(self.state, QueryState::Ready { .. }) {
      self.state = QueryState::Loading;
    }

    let layer = self.layer.clone();
    let action = self.action.clone();
    let params = self.params.clone();
    let opts = self.opts.clone();
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let result = layer
        .query(&action, &params, &opts, |data, origin| {
          // Ignore send errors - the LiveQuery may have been dropped
          let _ = tx.send((generation, Update::Data(data.clone(), origin)));
        })
        .await;

      let update = match result {
        Ok(outcome) => Update::Settled(outcome),
        Err(error) => Update::Failed(error),
      };
      let _ = tx.send((generation, update));
    });
  }
}

impl Drop for LiveQuery {
  fn drop(&mut self) {
    for id in self.subscriptions.drain(..) {
      self.layer.sync().unsubscribe(id);
    }
  }
}

impl std::fmt::Debug for LiveQuery {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LiveQuery")
      .field("action", &self.action)
      .field("params", &self.params)
      .field("state", &self.state)
      .field("generation", &self.generation.current())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{LayerSettings, MemoryStorage, TtlStore};
  use crate::clock::SystemClock;
  use crate::error::CallError;
  use crate::sync::{ContextId, SyncBroadcaster};
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;

  /// Layer whose caller echoes `params.term`, sleeping `params.delay_ms` first.
  fn echo_layer() -> CacheLayer {
    let clock = Arc::new(SystemClock);
    let store = TtlStore::new(Arc::new(MemoryStorage::new()), clock.clone());
    let caller = |_action: String, params: Value| async move {
      let delay = params["delay_ms"].as_u64().unwrap_or(0);
      tokio::time::sleep(Duration::from_millis(delay)).await;
      match params["term"].as_str() {
        Some("fail") => Err(CallError::Network("offline".into())),
        _ => Ok(params["term"].clone()),
      }
    };
    CacheLayer::new(
      store,
      Arc::new(caller),
      SyncBroadcaster::disconnected(ContextId::new(), clock),
      LayerSettings::default(),
    )
  }

  #[tokio::test]
  async fn test_live_query_success() {
    let mut query = LiveQuery::new(
      echo_layer(),
      "buscar",
      json!({"term": "ana"}),
      QueryOptions::new(),
    );
    assert_eq!(query.state(), &QueryState::Idle);

    query.fetch();
    assert!(query.state().is_loading());

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    assert_eq!(query.state().data(), Some(&json!("ana")));
    assert_eq!(query.state().origin(), Some(Origin::Network));
    assert!(!query.is_fetching());
  }

  #[tokio::test]
  async fn test_live_query_error() {
    let mut query = LiveQuery::new(
      echo_layer(),
      "buscar",
      json!({"term": "fail"}),
      QueryOptions::new(),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(query.poll());
    assert_eq!(
      query.state().error(),
      Some(&QueryError::Call(CallError::Network("offline".into())))
    );
  }

  #[tokio::test]
  async fn test_superseded_results_are_not_rendered() {
    let layer = echo_layer();
    let mut query = LiveQuery::new(
      layer.clone(),
      "buscar",
      json!({"term": "an", "delay_ms": 60}),
      QueryOptions::new(),
    );

    query.fetch();
    tokio::time::sleep(Duration::from_millis(5)).await;
    query.set_params(json!({"term": "ana", "delay_ms": 10}));

    tokio::time::sleep(Duration::from_millis(120)).await;
    query.poll();

    assert_eq!(query.state().data(), Some(&json!("ana")));
    assert_eq!(query.generation(), 2);
    // The superseded call still populated the cache.
    assert_eq!(
      layer.cached("buscar", &json!({"term": "an", "delay_ms": 60}), false),
      Some(json!("an"))
    );
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let mut query = LiveQuery::new(
      echo_layer(),
      "buscar",
      json!({"term": "x", "delay_ms": 50}),
      QueryOptions::new(),
    );

    query.fetch();
    query.fetch();
    assert_eq!(query.generation(), 1);

    query.refetch();
    assert_eq!(query.generation(), 2);
  }

  #[tokio::test]
  async fn test_cached_data_stays_visible_on_failed_refresh() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();
    let clock = Arc::new(SystemClock);
    let store = TtlStore::new(Arc::new(MemoryStorage::new()), clock.clone());
    let caller = move |_action: String, _params: Value| {
      let n = counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      async move {
        if n == 0 {
          Ok(json!(["ana"]))
        } else {
          Err(CallError::Network("offline".into()))
        }
      }
    };
    let layer = CacheLayer::new(
      store,
      Arc::new(caller),
      SyncBroadcaster::disconnected(ContextId::new(), clock),
      LayerSettings::default(),
    );

    let mut query = LiveQuery::new(layer, "listarClientes", json!({}), QueryOptions::new());
    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();

    query.refetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();

    assert_eq!(query.state().data(), Some(&json!(["ana"])));
    assert_eq!(query.state().origin(), Some(Origin::Cache));
    assert!(query.warning().is_some());
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_rehydrate_reads_cache_only() {
    let layer = echo_layer();
    let mut query = LiveQuery::new(layer.clone(), "buscar", json!({}), QueryOptions::new());

    assert!(!query.rehydrate());

    layer.store().set("buscar_{}", &json!(["from another tab"]), 5);
    assert!(query.rehydrate());
    assert_eq!(query.state().origin(), Some(Origin::Cache));
    assert!(!query.rehydrate());
  }
}
