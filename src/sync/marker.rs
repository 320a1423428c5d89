use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{ContextId, SignalRecord, SyncSignal, SyncTransport};
use crate::cache::Storage;

/// Storage key prefix reserved for durable sync markers.
pub const MARKER_PREFIX: &str = "swr:sync:";

/// Storage key holding the latest signal of `kind`.
pub fn marker_key(kind: &str) -> String {
  format!("{}{}", MARKER_PREFIX, kind)
}

/// Marker row: the latest signal plus how many signals of its kind were
/// published so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarkerRecord {
  #[serde(flatten)]
  record: SignalRecord,
  #[serde(default)]
  seq: u64,
}

/// Own publishes per marker key not yet matched against a sequence advance.
type OwnPublishes = Arc<Mutex<HashMap<String, u64>>>;

fn lock(own: &OwnPublishes) -> MutexGuard<'_, HashMap<String, u64>> {
  own.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Durable transport: one marker row per signal kind in the shared storage.
///
/// Every publish bumps the kind's sequence number. Listeners poll the
/// markers and deliver one signal per sequence step written by other
/// contexts, so publishes landing between two polls are not merged.
pub struct MarkerTransport {
  storage: Arc<dyn Storage>,
  origin: ContextId,
  poll_interval: Duration,
  own: OwnPublishes,
}

impl MarkerTransport {
  pub fn new(storage: Arc<dyn Storage>, origin: ContextId, poll_interval: Duration) -> Self {
    Self {
      storage,
      origin,
      poll_interval,
      own: Arc::default(),
    }
  }
}

fn decode(text: &str) -> Option<MarkerRecord> {
  serde_json::from_str(text).ok()
}

/// Decoded marker rows keyed by storage key.
fn read_markers(storage: &dyn Storage) -> Result<HashMap<String, MarkerRecord>> {
  let mut markers = HashMap::new();
  for key in storage.keys()? {
    if !key.starts_with(MARKER_PREFIX) {
      continue;
    }
    match storage.get_item(&key)?.as_deref().map(decode) {
      Some(Some(marker)) => {
        markers.insert(key, marker);
      }
      Some(None) => debug!(key = %key, "ignoring undecodable marker"),
      None => {}
    }
  }
  Ok(markers)
}

impl SyncTransport for MarkerTransport {
  fn name(&self) -> &'static str {
    "marker"
  }

  fn publish(&self, signal: &SyncSignal) -> Result<()> {
    let key = marker_key(&signal.kind);
    let mut own = lock(&self.own);

    let previous = self
      .storage
      .get_item(&key)?
      .as_deref()
      .and_then(decode)
      .map_or(0, |marker| marker.seq);

    let marker = MarkerRecord {
      record: SignalRecord {
        signal: signal.clone(),
        origin: self.origin,
      },
      seq: previous + 1,
    };
    let text =
      serde_json::to_string(&marker).map_err(|e| eyre!("Failed to encode marker: {}", e))?;

    self.storage.set_item(&key, &text)?;
    *own.entry(key).or_default() += 1;
    Ok(())
  }

  fn listen(&self, inbox: mpsc::UnboundedSender<SyncSignal>) -> Result<JoinHandle<()>> {
    // Markers present at startup are history, not news.
    let mut seen: HashMap<String, u64> = {
      let mut own = lock(&self.own);
      own.clear();
      read_markers(self.storage.as_ref())?
        .into_iter()
        .map(|(key, marker)| (key, marker.seq))
        .collect()
    };
    let storage = Arc::clone(&self.storage);
    let own = Arc::clone(&self.own);
    let poll_interval = self.poll_interval;

    Ok(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(poll_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
        ticker.tick().await;

        let current = match read_markers(storage.as_ref()) {
          Ok(current) => current,
          Err(e) => {
            warn!(error = %e, "sync marker poll failed");
            continue;
          }
        };

        let mut pending = lock(&own);
        for (key, marker) in &current {
          let advanced = marker.seq.saturating_sub(seen.get(key).copied().unwrap_or(0));
          if advanced == 0 {
            continue;
          }

          // Steps this context wrote itself are not delivered.
          let mine = pending.get(key).copied().unwrap_or(0).min(advanced);
          if let Some(count) = pending.get_mut(key) {
            *count -= mine;
          }

          for _ in mine..advanced {
            if inbox.send(marker.record.signal.clone()).is_err() {
              return;
            }
          }
        }
        drop(pending);

        seen = current
          .into_iter()
          .map(|(key, marker)| (key, marker.seq))
          .collect();
      }
    }))
  }

  fn last_signal(&self, kind: &str) -> Option<SyncSignal> {
    let text = self.storage.get_item(&marker_key(kind)).ok().flatten()?;
    decode(&text).map(|marker| marker.record.signal)
  }
}
