//! Composition root: wires one context's store, broadcaster and query layer.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::api::NetworkCaller;
use crate::cache::{CacheLayer, Storage, TtlStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::sync::{
  ChannelTransport, ContextId, MarkerTransport, SyncBroadcaster, SyncBus, SyncTransport,
};

/// Everything one context (one "tab") needs.
///
/// Contexts built over the same `Storage` share cached data; contexts also
/// handed the same `SyncBus` get low-latency notifications from each other.
#[derive(Clone)]
pub struct Context {
  id: ContextId,
  layer: CacheLayer,
}

impl Context {
  pub fn new(
    config: &Config,
    storage: Arc<dyn Storage>,
    caller: Arc<dyn NetworkCaller>,
    bus: Option<&SyncBus>,
  ) -> Self {
    Self::with_clock(config, storage, caller, bus, Arc::new(SystemClock))
  }

  pub fn with_clock(
    config: &Config,
    storage: Arc<dyn Storage>,
    caller: Arc<dyn NetworkCaller>,
    bus: Option<&SyncBus>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let id = ContextId::new();
    let mut transports: Vec<Arc<dyn SyncTransport>> = Vec::new();

    if config.sync.channel {
      if let Some(bus) = bus {
        transports.push(Arc::new(ChannelTransport::new(bus.clone(), id)));
      }
    }
    if config.sync.marker {
      transports.push(Arc::new(MarkerTransport::new(
        Arc::clone(&storage),
        id,
        config.sync.poll_interval(),
      )));
    }

    let store = TtlStore::new(storage, Arc::clone(&clock));
    let sync = SyncBroadcaster::new(id, clock, transports);
    let layer = CacheLayer::new(store, caller, sync, config.layer_settings());

    Self { id, layer }
  }

  /// Begin receiving signals from other contexts. Needs a Tokio runtime.
  pub fn start(&self) -> Result<()> {
    self.layer.sync().start()?;
    info!(
      context = %self.id,
      transports = ?self.layer.sync().transport_names(),
      "context started"
    );
    Ok(())
  }

  pub fn id(&self) -> ContextId {
    self.id
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  pub fn store(&self) -> &TtlStore {
    self.layer.store()
  }

  pub fn sync(&self) -> &SyncBroadcaster {
    self.layer.sync()
  }

  pub fn shutdown(&self) {
    self.layer.sync().shutdown();
  }
}
