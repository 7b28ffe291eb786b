//! Ownership of the single active transport client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::io::{Connector, WsConnector};
use crate::transport::TransportClient;

/// Owns at most one [`TransportClient`] at a time
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    client: Mutex<Option<Arc<TransportClient>>>,
    clients_created: AtomicUsize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(WsConnector::new()))
    }

    /// Manager whose clients open connections through `connector`
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            client: Mutex::new(None),
            clients_created: AtomicUsize::new(0),
        }
    }

    /// Replace the active client with a fresh one and start connecting it
    ///
    /// Any previous client is disconnected first, so at most one client is
    /// ever live. Must be called from within a Tokio runtime.
    pub fn initialize(&self, config: ConnectionConfig) -> Arc<TransportClient> {
        self.initialize_with(config, |_| ()).0
    }

    /// Like [`initialize`](Self::initialize), but runs `setup` on the new
    /// client before it starts connecting
    ///
    /// Listeners registered in `setup` see every event of the first
    /// connection, including its first frame. Returns the client together
    /// with whatever `setup` produced.
    pub fn initialize_with<F, R>(
        &self,
        config: ConnectionConfig,
        setup: F,
    ) -> (Arc<TransportClient>, R)
    where
        F: FnOnce(&TransportClient) -> R,
    {
        let mut slot = self.client.lock();
        if let Some(previous) = slot.take() {
            debug!("Replacing client for {}", previous.config().url);
            previous.disconnect();
        }

        info!("Initializing telemetry connection to {}", config.url);
        let client = Arc::new(TransportClient::with_connector(
            config,
            self.connector.clone(),
        ));
        self.clients_created.fetch_add(1, Ordering::SeqCst);
        let prepared = setup(&client);
        client.connect();

        *slot = Some(client.clone());
        (client, prepared)
    }

    pub fn client(&self) -> Option<Arc<TransportClient>> {
        self.client.lock().clone()
    }

    /// Disconnect and discard the active client, if any
    pub fn disconnect(&self) {
        if let Some(client) = self.client.lock().take() {
            info!("Closing telemetry connection to {}", client.config().url);
            client.disconnect();
        }
    }

    /// Number of clients built over this manager's lifetime
    pub fn clients_created(&self) -> usize {
        self.clients_created.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client", &self.client.lock().as_deref())
            .field("clients_created", &self.clients_created())
            .finish()
    }
}
