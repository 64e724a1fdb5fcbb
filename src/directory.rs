//! Event-type keyed lookup of hubs.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::hub::{BroadcastReport, ErrorReceiver, Hub, HubCore};
use crate::storage::StorageProvider;
use crate::types::Event;

/// Holds at most one hub per event type.
///
/// Every hub created through the directory shares its config, shutdown token
/// and error receiver.
pub struct HubDirectory {
    hubs: RwLock<HashMap<String, Arc<HubCore>>>,
    config: Arc<HubConfig>,
    shutdown: CancellationToken,
    errors: Option<Arc<dyn ErrorReceiver>>,
}

impl HubDirectory {
    pub fn new(config: HubConfig, shutdown: CancellationToken) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            config: Arc::new(config),
            shutdown,
            errors: None,
        }
    }

    /// Report transient storage failures of every hub created afterwards to `errors`.
    pub fn with_error_receiver(mut self, errors: Arc<dyn ErrorReceiver>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn config(&self) -> &Arc<HubConfig> {
        &self.config
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Register a hub under its event type, replacing any previous one.
    pub fn register<E: Event>(&self, hub: &Hub<E>) {
        self.register_core(Arc::clone(hub.core()));
    }

    fn register_core(&self, core: Arc<HubCore>) {
        let event_type = core.event_type().to_string();
        if self.hubs.write().insert(event_type.clone(), core).is_some() {
            tracing::warn!(event_type = %event_type, "Replaced existing hub registration");
        }
    }

    /// Build a hub for `E` on `storage` and register it.
    pub fn create_hub<E: Event>(&self, storage: Arc<dyn StorageProvider>) -> Hub<E> {
        let hub = Hub::new(
            Arc::clone(&self.config),
            storage,
            self.shutdown.clone(),
            self.errors.clone(),
        );
        self.register(&hub);
        hub
    }

    pub fn hub(&self, event_type: &str) -> Option<Arc<HubCore>> {
        self.hubs.read().get(event_type).cloned()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.hubs.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.hubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.read().is_empty()
    }

    /// Initialize every registered hub concurrently.
    ///
    /// Fails with the first hub error encountered; hubs that did initialize
    /// stay initialized, and re-running is harmless.
    pub async fn initialize_all(&self) -> Result<()> {
        let hubs: Vec<Arc<HubCore>> = self.hubs.read().values().cloned().collect();

        let mut set = JoinSet::new();
        for hub in hubs {
            set.spawn(async move {
                let result = hub.initialize().await;
                (hub.event_type().to_string(), result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let (event_type, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    first_error.get_or_insert(HubError::Initialization {
                        event_type: "<unknown>".to_string(),
                        source: Box::new(HubError::Transport(format!("initialize task failed: {e}"))),
                    });
                    continue;
                }
            };
            if let Err(e) = result {
                tracing::debug!(event_type = %event_type, error = %e, "Hub initialization failed");
                first_error.get_or_insert(HubError::Initialization {
                    event_type,
                    source: Box::new(e),
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Broadcast `event` through the hub registered for `E`.
    pub async fn route<E: Event>(&self, event: &E, cancel: CancellationToken) -> Result<BroadcastReport> {
        let hub = self.require(E::event_type())?;
        let payload = hub.codec().encode(event)?;
        Ok(hub.broadcast_raw(payload, cancel).await)
    }

    /// Broadcast an already encoded payload.
    pub async fn route_raw(
        &self,
        event_type: &str,
        payload: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<BroadcastReport> {
        let hub = self.require(event_type)?;
        Ok(hub.broadcast_raw(payload, cancel).await)
    }

    fn require(&self, event_type: &str) -> Result<Arc<HubCore>> {
        self.hub(event_type)
            .ok_or_else(|| HubError::UnregisteredEventType(event_type.to_string()))
    }
}
