//! Single-flight gate: at most one outstanding network refresh per key.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::QueryError;

/// How an in-flight request settled.
pub type Settled = Result<Value, QueryError>;

type Slots = Arc<Mutex<HashMap<String, watch::Receiver<Option<Settled>>>>>;

/// Result of [`RequestGate::try_enter`].
pub enum GateEntry {
  /// The caller owns the refresh and must settle it through the token.
  Leader(GateToken),
  /// Another caller already owns the refresh; wait for its outcome.
  Busy(GateWaiter),
}

/// Per-context registry of in-flight keys.
#[derive(Clone, Default)]
pub struct RequestGate {
  slots: Slots,
}

impl RequestGate {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn try_enter(&self, key: &str) -> GateEntry {
    let mut slots = lock(&self.slots);

    if let Some(rx) = slots.get(key) {
      return GateEntry::Busy(GateWaiter {
        key: key.to_string(),
        rx: rx.clone(),
      });
    }

    let (tx, rx) = watch::channel(None);
    slots.insert(key.to_string(), rx);

    GateEntry::Leader(GateToken {
      key: key.to_string(),
      slots: Arc::clone(&self.slots),
      tx: Some(tx),
    })
  }

  pub fn is_busy(&self, key: &str) -> bool {
    lock(&self.slots).contains_key(key)
  }

  /// Number of keys currently held.
  pub fn in_flight(&self) -> usize {
    lock(&self.slots).len()
  }
}

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<Settled>>>> {
  slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of one key's refresh.
///
/// Dropping the token without calling [`GateToken::leave`] still frees the
/// key; waiters then see [`QueryError::Abandoned`].
pub struct GateToken {
  key: String,
  slots: Slots,
  tx: Option<watch::Sender<Option<Settled>>>,
}

impl GateToken {
  pub fn key(&self) -> &str {
    &self.key
  }

  /// Publish the outcome to every waiter and release the key.
  pub fn leave(mut self, outcome: Settled) {
    if let Some(tx) = self.tx.take() {
      tx.send_replace(Some(outcome));
      lock(&self.slots).remove(&self.key);
    }
  }
}

impl Drop for GateToken {
  fn drop(&mut self) {
    if self.tx.take().is_some() {
      lock(&self.slots).remove(&self.key);
    }
  }
}

/// Handle on another caller's in-flight refresh.
pub struct GateWaiter {
  key: String,
  rx: watch::Receiver<Option<Settled>>,
}

impl GateWaiter {
  /// Wait for the leader's outcome, giving up after `timeout`.
  pub async fn wait(self, timeout: Option<Duration>) -> Settled {
    let key = self.key;
    let mut rx = self.rx;

    let settled = async {
      match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or_else(|| {
          Err(QueryError::Abandoned { key: key.clone() })
        }),
        Err(_) => Err(QueryError::Abandoned { key: key.clone() }),
      }
    };

    match timeout {
      Some(limit) => match tokio::time::timeout(limit, settled).await {
        Ok(outcome) => outcome,
        Err(_) => Err(QueryError::Timeout {
          key: key.clone(),
          waited_ms: limit.as_millis() as u64,
        }),
      },
      None => settled.await,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CallError;
  use serde_json::json;

  fn leader(entry: GateEntry) -> GateToken {
    match entry {
      GateEntry::Leader(token) => token,
      GateEntry::Busy(_) => panic!("expected leader"),
    }
  }

  fn waiter(entry: GateEntry) -> GateWaiter {
    match entry {
      GateEntry::Busy(waiter) => waiter,
      GateEntry::Leader(_) => panic!("expected busy"),
    }
  }

  #[tokio::test]
  async fn test_second_enter_is_busy_until_leave() {
    let gate = RequestGate::new();
    let token = leader(gate.try_enter("k"));
    let pending = waiter(gate.try_enter("k"));
    assert!(gate.is_busy("k"));

    // Other keys are independent.
    let other = leader(gate.try_enter("other"));
    assert_eq!(gate.in_flight(), 2);

    token.leave(Ok(json!([1, 2])));
    assert!(!gate.is_busy("k"));
    assert_eq!(pending.wait(None).await, Ok(json!([1, 2])));

    other.leave(Ok(json!(null)));
    assert_eq!(gate.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_all_waiters_receive_same_outcome() {
    let gate = RequestGate::new();
    let token = leader(gate.try_enter("k"));
    let waiters: Vec<_> = (0..3).map(|_| waiter(gate.try_enter("k"))).collect();

    let handles: Vec<_> = waiters
      .into_iter()
      .map(|w| tokio::spawn(w.wait(None)))
      .collect();

    let err = QueryError::from(CallError::Network("offline".into()));
    token.leave(Err(err.clone()));

    for handle in handles {
      assert_eq!(handle.await.unwrap(), Err(err.clone()));
    }
  }

  #[tokio::test]
  async fn test_dropped_token_releases_and_abandons() {
    let gate = RequestGate::new();
    let token = leader(gate.try_enter("k"));
    let pending = waiter(gate.try_enter("k"));

    drop(token);

    assert!(!gate.is_busy("k"));
    assert_eq!(
      pending.wait(None).await,
      Err(QueryError::Abandoned { key: "k".into() })
    );
    // The key can be entered again.
    let _token = leader(gate.try_enter("k"));
  }

  #[tokio::test]
  async fn test_waiter_times_out() {
    let gate = RequestGate::new();
    let _token = leader(gate.try_enter("k"));
    let pending = waiter(gate.try_enter("k"));

    let outcome = pending.wait(Some(Duration::from_millis(20))).await;
    assert_eq!(
      outcome,
      Err(QueryError::Timeout {
        key: "k".into(),
        waited_ms: 20
      })
    );
  }
}
