use color_eyre::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use super::{ContextId, SignalRecord, SyncSignal, SyncTransport};

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Process-wide pub/sub bus shared by every context's [`ChannelTransport`].
#[derive(Clone)]
pub struct SyncBus {
  tx: broadcast::Sender<SignalRecord>,
}

impl SyncBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }
}

impl Default for SyncBus {
  fn default() -> Self {
    Self::new(DEFAULT_BUS_CAPACITY)
  }
}

/// Low-latency transport. Delivers immediately to listening contexts.
pub struct ChannelTransport {
  bus: SyncBus,
  origin: ContextId,
}

impl ChannelTransport {
  pub fn new(bus: SyncBus, origin: ContextId) -> Self {
    Self { bus, origin }
  }
}

impl SyncTransport for ChannelTransport {
  fn name(&self) -> &'static str {
    "channel"
  }

  fn publish(&self, signal: &SyncSignal) -> Result<()> {
    // No listeners is not an error.
    let _ = self.bus.tx.send(SignalRecord {
      signal: signal.clone(),
      origin: self.origin,
    });
    Ok(())
  }

  fn listen(&self, inbox: mpsc::UnboundedSender<SyncSignal>) -> Result<JoinHandle<()>> {
    let mut rx = self.bus.tx.subscribe();
    let origin = self.origin;

    Ok(tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(record) if record.origin == origin => continue,
          Ok(record) => {
            if inbox.send(record.signal).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "sync bus lagged, signals dropped");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    }))
  }
}
