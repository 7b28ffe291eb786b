//! Wiring of connection manager and telemetry store
//!
//! A [`TelemetryContext`] is the explicit owner of everything the live data
//! path needs: it starts the connection, routes decoded messages into the
//! store and tears both down again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::io::Connector;
use crate::manager::ConnectionManager;
use crate::store::TelemetryStore;
use crate::transport::{ListenerId, TransportClient};

/// Log a progress line every this many messages
const LOG_EVERY: u64 = 50;

#[derive(Debug)]
pub struct TelemetryContext {
    manager: ConnectionManager,
    store: TelemetryStore,
    messages_processed: Arc<AtomicU64>,
    active: Mutex<Option<(Arc<TransportClient>, ListenerId)>>,
}

impl TelemetryContext {
    pub fn new() -> Self {
        Self::from_manager(ConnectionManager::new())
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self::from_manager(ConnectionManager::with_connector(connector))
    }

    fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            store: TelemetryStore::new(),
            messages_processed: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    /// Connect to `config.url` and feed every decoded message into the store
    ///
    /// Starting an already started context shuts the previous session down
    /// first. Must be called from within a Tokio runtime.
    pub fn start(&self, config: ConnectionConfig) -> Arc<TransportClient> {
        self.shutdown();

        let store = self.store.clone();
        let counter = self.messages_processed.clone();
        // the store listener must exist before the first frame can arrive
        let (client, listener) = self.manager.initialize_with(config, |client| {
            client.on_message(move |message| {
                store.record_and_dispatch(message);
                let processed = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if processed % LOG_EVERY == 0 {
                    debug!(
                        "Processed {} telemetry messages ({} devices cached)",
                        processed,
                        store.device_count()
                    );
                }
            })
        });

        *self.active.lock() = Some((client.clone(), listener));
        client
    }

    /// Stop the connection and clear all cached state
    pub fn shutdown(&self) {
        let Some((client, listener)) = self.active.lock().take() else {
            return;
        };

        client.off(listener);
        self.manager.disconnect();
        self.store.reset();
        info!(
            "Telemetry context shut down after {} messages",
            self.messages_processed.load(Ordering::SeqCst)
        );
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::SeqCst)
    }
}

impl Default for TelemetryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TelemetryContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
