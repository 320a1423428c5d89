//! Cross-context "data changed" notifications.
//!
//! A [`SyncBroadcaster`] fans each published signal out over every attached
//! [`SyncTransport`] and dispatches signals arriving from *other* contexts to
//! local subscribers. Two transports exist:
//!
//! - [`ChannelTransport`]: low latency, in-process broadcast bus
//! - [`MarkerTransport`]: durable marker rows in the shared storage, polled
//!
//! Receivers never re-publish what they receive, and a context never hears
//! its own signals. A context updates itself through its own query callbacks.

mod channel;
mod marker;

pub use channel::{ChannelTransport, SyncBus};
pub use marker::{marker_key, MarkerTransport, MARKER_PREFIX};

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;

/// Identity of one context (the equivalent of a browser tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for ContextId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for ContextId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// "This class of data changed" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSignal {
  #[serde(rename = "type")]
  pub kind: String,
  /// Emission time in epoch milliseconds. Informational only.
  pub timestamp: i64,
}

/// A signal plus the context that emitted it, as carried by transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
  #[serde(flatten)]
  pub signal: SyncSignal,
  pub origin: ContextId,
}

/// One way of moving signals between contexts.
pub trait SyncTransport: Send + Sync {
  fn name(&self) -> &'static str;

  fn publish(&self, signal: &SyncSignal) -> Result<()>;

  /// Forward signals emitted by other contexts into `inbox`.
  fn listen(&self, inbox: mpsc::UnboundedSender<SyncSignal>) -> Result<JoinHandle<()>>;

  /// Most recent durable signal of `kind`, if the transport keeps one.
  fn last_signal(&self, _kind: &str) -> Option<SyncSignal> {
    None
  }
}

pub type SignalHandler = Arc<dyn Fn(&SyncSignal) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
  id: SubscriptionId,
  kind: String,
  handler: SignalHandler,
}

struct Inner {
  origin: ContextId,
  clock: Arc<dyn Clock>,
  transports: Vec<Arc<dyn SyncTransport>>,
  subscriptions: Mutex<Vec<Subscription>>,
  next_id: AtomicU64,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
  fn dispatch(&self, signal: &SyncSignal) {
    let handlers: Vec<SignalHandler> = lock(&self.subscriptions)
      .iter()
      .filter(|s| s.kind == signal.kind)
      .map(|s| Arc::clone(&s.handler))
      .collect();

    debug!(
      kind = %signal.kind,
      handlers = handlers.len(),
      "dispatching sync signal"
    );

    for handler in handlers {
      handler(signal);
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
    for task in tasks.drain(..) {
      task.abort();
    }
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes and receives sync signals for one context.
#[derive(Clone)]
pub struct SyncBroadcaster {
  inner: Arc<Inner>,
}

impl SyncBroadcaster {
  pub fn new(
    origin: ContextId,
    clock: Arc<dyn Clock>,
    transports: Vec<Arc<dyn SyncTransport>>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        origin,
        clock,
        transports,
        subscriptions: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Broadcaster with no transports; publishing is a no-op.
  pub fn disconnected(origin: ContextId, clock: Arc<dyn Clock>) -> Self {
    Self::new(origin, clock, Vec::new())
  }

  pub fn origin(&self) -> ContextId {
    self.inner.origin
  }

  pub fn transport_names(&self) -> Vec<&'static str> {
    self.inner.transports.iter().map(|t| t.name()).collect()
  }

  /// Tell other contexts that `kind` changed. Transport failures are logged.
  pub fn publish(&self, kind: &str) -> SyncSignal {
    let signal = SyncSignal {
      kind: kind.to_string(),
      timestamp: self.inner.clock.now_ms(),
    };

    for transport in &self.inner.transports {
      if let Err(e) = transport.publish(&signal) {
        warn!(
          transport = transport.name(),
          kind,
          error = %e,
          "sync publish failed"
        );
      }
    }

    debug!(kind, origin = %self.inner.origin, "published sync signal");
    signal
  }

  /// Run `handler` whenever another context publishes `kind`.
  ///
  /// Handlers run on the dispatcher task, must be cheap and idempotent, and
  /// must not publish `kind` again.
  pub fn subscribe<F>(&self, kind: &str, handler: F) -> SubscriptionId
  where
    F: Fn(&SyncSignal) + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    lock(&self.inner.subscriptions).push(Subscription {
      id,
      kind: kind.to_string(),
      handler: Arc::new(handler),
    });
    id
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut subscriptions = lock(&self.inner.subscriptions);
    let before = subscriptions.len();
    subscriptions.retain(|s| s.id != id);
    subscriptions.len() != before
  }

  /// Start listening on every transport. Calling it twice is a no-op.
  pub fn start(&self) -> Result<()> {
    let mut tasks = lock(&self.inner.tasks);
    if !tasks.is_empty() {
      return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<SyncSignal>();

    for transport in &self.inner.transports {
      match transport.listen(tx.clone()) {
        Ok(task) => tasks.push(task),
        Err(e) => warn!(
          transport = transport.name(),
          error = %e,
          "sync transport unavailable, continuing without it"
        ),
      }
    }
    drop(tx);

    let inner: Weak<Inner> = Arc::downgrade(&self.inner);
    tasks.push(tokio::spawn(async move {
      while let Some(signal) = rx.recv().await {
        match inner.upgrade() {
          Some(inner) => inner.dispatch(&signal),
          None => break,
        }
      }
    }));

    Ok(())
  }

  /// Stop all listener tasks.
  pub fn shutdown(&self) {
    for task in lock(&self.inner.tasks).drain(..) {
      task.abort();
    }
  }

  /// Latest durable signal of `kind`, for contexts that were not listening.
  pub fn last_update(&self, kind: &str) -> Option<SyncSignal> {
    self
      .inner
      .transports
      .iter()
      .filter_map(|t| t.last_signal(kind))
      .max_by_key(|s| s.timestamp)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::clock::SystemClock;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn counter(broadcaster: &SyncBroadcaster, kind: &str) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);
    broadcaster.subscribe(kind, move |_| {
      hits_clone.fetch_add(1, Ordering::SeqCst);
    });
    hits
  }

  fn channel_pair() -> (SyncBroadcaster, SyncBroadcaster) {
    let bus = SyncBus::default();
    let make = || {
      let origin = ContextId::new();
      SyncBroadcaster::new(
        origin,
        Arc::new(SystemClock),
        vec![Arc::new(ChannelTransport::new(bus.clone(), origin))],
      )
    };
    (make(), make())
  }

  #[tokio::test]
  async fn test_other_context_receives_signal() {
    let (tab_a, tab_b) = channel_pair();
    tab_a.start().unwrap();
    tab_b.start().unwrap();

    let seen_by_a = counter(&tab_a, "clients-updated");
    let seen_by_b = counter(&tab_b, "clients-updated");
    let other_kind = counter(&tab_b, "cases-updated");

    tab_a.publish("clients-updated");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(seen_by_b.load(Ordering::SeqCst), 1);
    assert_eq!(seen_by_a.load(Ordering::SeqCst), 0);
    assert_eq!(other_kind.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_repeated_publishes_are_not_debounced() {
    let (tab_a, tab_b) = channel_pair();
    tab_b.start().unwrap();
    let seen = counter(&tab_b, "clients-updated");

    for _ in 0..3 {
      tab_a.publish("clients-updated");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_marker_only_repeated_publishes_are_not_debounced() {
    let storage: Arc<dyn crate::cache::Storage> = Arc::new(MemoryStorage::new());
    let make = || {
      let origin = ContextId::new();
      SyncBroadcaster::new(
        origin,
        Arc::new(SystemClock),
        vec![Arc::new(MarkerTransport::new(
          Arc::clone(&storage),
          origin,
          Duration::from_millis(50),
        ))],
      )
    };
    let (tab_a, tab_b) = (make(), make());
    tab_b.start().unwrap();
    let seen = counter(&tab_b, "clients-updated");

    for _ in 0..3 {
      tab_a.publish("clients-updated");
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_unsubscribe_stops_delivery() {
    let (tab_a, tab_b) = channel_pair();
    tab_b.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);
    let id = tab_b.subscribe("clients-updated", move |_| {
      hits_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert!(tab_b.unsubscribe(id));
    assert!(!tab_b.unsubscribe(id));

    tab_a.publish("clients-updated");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_disconnected_publish_is_noop() {
    let broadcaster = SyncBroadcaster::disconnected(ContextId::new(), Arc::new(SystemClock));
    broadcaster.start().unwrap();
    let signal = broadcaster.publish("clients-updated");
    assert_eq!(signal.kind, "clients-updated");
    assert!(broadcaster.transport_names().is_empty());
  }

  #[tokio::test]
  async fn test_last_update_reads_marker() {
    let storage: Arc<dyn crate::cache::Storage> = Arc::new(MemoryStorage::new());
    let origin = ContextId::new();
    let broadcaster = SyncBroadcaster::new(
      origin,
      Arc::new(SystemClock),
      vec![Arc::new(MarkerTransport::new(
        Arc::clone(&storage),
        origin,
        Duration::from_millis(10),
      ))],
    );

    assert_eq!(broadcaster.last_update("clients-updated"), None);
    let signal = broadcaster.publish("clients-updated");
    assert_eq!(broadcaster.last_update("clients-updated"), Some(signal));
  }

  #[test]
  fn test_signal_wire_format() {
    let record = SignalRecord {
      signal: SyncSignal {
        kind: "clients-updated".into(),
        timestamp: 42,
      },
      origin: ContextId::new(),
    };
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["type"], "clients-updated");
    assert_eq!(value["timestamp"], 42);
    assert!(value["origin"].is_string());
  }
}
