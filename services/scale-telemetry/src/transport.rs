//! Telemetry transport client
//!
//! One [`TransportClient`] owns at most one socket to one endpoint. A single
//! Tokio task per connection performs the open, the read loop, outbound
//! writes and the fixed-interval reconnect sleep. Inbound frames are decoded
//! into [`WireMessage`]s and handed to the registered message listeners on
//! that same task, so there is no async boundary between "decoded" and
//! "delivered".

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{panic_message, TelemetryError};
use crate::io::{ConnectionPair, Connector, WsConnector};
use crate::wire::{decode_frame, WireMessage};

/// Lifecycle state of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Handle returned by listener registration, used to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type MessageListener = Arc<dyn Fn(&WireMessage) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&TelemetryError) + Send + Sync>;
type EventListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    message: Vec<(ListenerId, MessageListener)>,
    error: Vec<(ListenerId, ErrorListener)>,
    open: Vec<(ListenerId, EventListener)>,
    close: Vec<(ListenerId, EventListener)>,
}

impl Listeners {
    fn remove(&mut self, id: ListenerId) -> bool {
        fn take<T>(list: &mut Vec<(ListenerId, T)>, id: ListenerId) -> bool {
            match list.iter().position(|(existing, _)| *existing == id) {
                Some(index) => {
                    list.remove(index);
                    true
                }
                None => false,
            }
        }

        take(&mut self.message, id)
            || take(&mut self.error, id)
            || take(&mut self.open, id)
            || take(&mut self.close, id)
    }
}

/// State owned by whichever connection task is current
///
/// `generation` changes on every `connect()`, so a task that was cancelled
/// but has not finished yet can neither overwrite the state of its successor
/// nor fire events on its behalf.
struct Link {
    generation: u64,
    state: ReadyState,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    link: Mutex<Link>,
    attempts: AtomicU32,
    next_listener: AtomicU64,
    listeners: Mutex<Listeners>,
}

struct ConnectionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// WebSocket client for the telemetry endpoint
pub struct TransportClient {
    shared: Arc<Shared>,
    task: Mutex<Option<ConnectionTask>>,
}

impl TransportClient {
    /// Create a client that connects over WebSocket
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector::new()))
    }

    /// Create a client with a custom connector
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                link: Mutex::new(Link {
                    generation: 0,
                    state: ReadyState::Closed,
                    outbound: None,
                }),
                attempts: AtomicU32::new(0),
                next_listener: AtomicU64::new(1),
                listeners: Mutex::new(Listeners::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Start connecting in the background
    ///
    /// Returns immediately. Does nothing if a connection task is already
    /// running (open, opening, or waiting to reconnect). After the retry
    /// budget was exhausted, calling this again starts over with a zero
    /// attempt counter. Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut task = self.task.lock();
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                debug!("Connection task for {} already running", self.shared.config.url);
                return;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot connect to {}: {}", self.shared.config.url, e);
                return;
            }
        };

        let generation = {
            let mut link = self.shared.link.lock();
            link.generation += 1;
            link.state = ReadyState::Connecting;
            link.outbound = None;
            link.generation
        };
        self.shared.attempts.store(0, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_connection(
            self.shared.clone(),
            generation,
            cancel.clone(),
        ));
        *task = Some(ConnectionTask { cancel, handle });
    }

    /// Close the connection and cancel any pending reconnect
    ///
    /// Idempotent. Never triggers a reconnection.
    pub fn disconnect(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };

        {
            let mut link = self.shared.link.lock();
            link.outbound = None;
            link.state = match link.state {
                ReadyState::Open => ReadyState::Closing,
                _ => ReadyState::Closed,
            };
        }

        debug!("Disconnecting from {}", self.shared.config.url);
        task.cancel.cancel();
    }

    /// JSON-encode `payload` and transmit it if the connection is open
    ///
    /// Otherwise the payload is dropped with a warning; nothing is queued.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) {
        let link = self.shared.link.lock();
        let sender = match (&link.outbound, link.state) {
            (Some(sender), ReadyState::Open) => sender,
            _ => {
                warn!("Telemetry socket is not connected, dropping outbound message");
                return;
            }
        };

        match serde_json::to_string(payload) {
            Ok(text) => {
                if sender.send(text).is_err() {
                    warn!("Connection task has stopped, dropping outbound message");
                }
            }
            Err(e) => warn!("Failed to encode outbound message: {}", e),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.link.lock().state
    }

    /// Consecutive reconnection attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        let id = self.shared.listener_id();
        self.shared
            .listeners
            .lock()
            .message
            .push((id, Arc::new(listener)));
        id
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TelemetryError) + Send + Sync + 'static,
    {
        let id = self.shared.listener_id();
        self.shared
            .listeners
            .lock()
            .error
            .push((id, Arc::new(listener)));
        id
    }

    pub fn on_open<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.listener_id();
        self.shared.listeners.lock().open.push((id, Arc::new(listener)));
        id
    }

    pub fn on_close<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.listener_id();
        self.shared
            .listeners
            .lock()
            .close
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove one listener registration
    ///
    /// Returns false if `id` was not registered (or was already removed).
    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.listeners.lock().remove(id)
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("url", &self.shared.config.url)
            .field("ready_state", &self.ready_state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

/// Why the read/write loop of an open connection stopped
enum LoopExit {
    Closed,
    Cancelled,
}

impl Shared {
    fn listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link.lock().generation == generation
    }

    fn set_state(&self, generation: u64, state: ReadyState) {
        let mut link = self.link.lock();
        if link.generation == generation {
            link.state = state;
            if state != ReadyState::Open {
                link.outbound = None;
            }
        }
    }

    fn mark_open(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) {
        let mut link = self.link.lock();
        if link.generation == generation {
            link.state = ReadyState::Open;
            link.outbound = Some(outbound);
        }
    }

    fn emit_message(&self, message: &WireMessage) {
        let listeners: Vec<MessageListener> = self
            .listeners
            .lock()
            .message
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(message))) {
                error!(
                    "Message listener panicked for device '{}': {}",
                    message.device_id,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn emit_error(&self, err: &TelemetryError) {
        let listeners: Vec<ErrorListener> = self
            .listeners
            .lock()
            .error
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(err))) {
                error!("Error listener panicked: {}", panic_message(payload.as_ref()));
            }
        }
    }

    fn emit_open(&self) {
        let listeners = Self::snapshot(&self.listeners.lock().open);
        Self::fire("open", listeners);
    }

    fn emit_close(&self) {
        let listeners = Self::snapshot(&self.listeners.lock().close);
        Self::fire("close", listeners);
    }

    fn snapshot(list: &[(ListenerId, EventListener)]) -> Vec<EventListener> {
        list.iter().map(|(_, listener)| listener.clone()).collect()
    }

    fn fire(kind: &str, listeners: Vec<EventListener>) {
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener())) {
                error!(
                    "{} listener panicked: {}",
                    kind,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(message) => self.emit_message(&message),
            Err(e) => warn!("Failed to decode telemetry frame: {}", e),
        }
    }

    /// Pump one open connection until it closes or is cancelled
    async fn run_open(
        &self,
        generation: u64,
        pair: ConnectionPair,
        mut outbound: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> LoopExit {
        let ConnectionPair {
            mut reader,
            mut writer,
        } = pair;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if let Err(e) = writer.close().await {
                        debug!("Error sending close frame: {}", e);
                    }
                    return LoopExit::Cancelled;
                }

                Some(text) = outbound.recv() => {
                    if let Err(e) = writer.write_frame(&text).await {
                        warn!("Failed to write to {}: {}", self.config.url, e);
                        if self.is_current(generation) {
                            self.emit_error(&e);
                        }
                        return LoopExit::Closed;
                    }
                }

                frame = reader.read_frame() => match frame {
                    Ok(Some(text)) if self.is_current(generation) => self.handle_frame(&text),
                    Ok(Some(_)) => debug!("Dropping frame from superseded connection"),
                    Ok(None) => {
                        info!("Telemetry connection closed by {}", self.config.url);
                        return LoopExit::Closed;
                    }
                    Err(e) => {
                        warn!("Error reading from {}: {}", self.config.url, e);
                        if self.is_current(generation) {
                            self.emit_error(&e);
                        }
                        return LoopExit::Closed;
                    }
                },
            }
        }
    }

    /// Apply the reconnection policy after a close
    ///
    /// Returns true when another attempt should be made.
    async fn wait_for_retry(&self, cancel: &CancellationToken) -> bool {
        let max = self.config.max_reconnect_attempts;
        let attempt = self.attempts.load(Ordering::SeqCst);
        if attempt >= max {
            error!(
                "Max reconnect attempts ({}) reached for {}",
                max, self.config.url
            );
            return false;
        }

        let attempt = attempt + 1;
        self.attempts.store(attempt, Ordering::SeqCst);
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            self.config.url,
            self.config.reconnect_interval(),
            attempt,
            max
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reconnection to {} cancelled", self.config.url);
                false
            }
            _ = tokio::time::sleep(self.config.reconnect_interval()) => true,
        }
    }
}

async fn run_connection(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    loop {
        shared.set_state(generation, ReadyState::Connecting);
        debug!("Opening connection to {}", shared.config.url);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = shared.connector.connect(&shared.config.url) => result,
        };

        match opened {
            Ok(pair) => {
                let (tx, rx) = mpsc::unbounded_channel();
                shared.attempts.store(0, Ordering::SeqCst);
                shared.mark_open(generation, tx);
                info!("Connected to {}", shared.config.url);
                if shared.is_current(generation) {
                    shared.emit_open();
                }

                let exit = shared.run_open(generation, pair, rx, &cancel).await;
                shared.set_state(generation, ReadyState::Closed);
                // a superseded task stays silent; its successor owns the events
                if shared.is_current(generation) {
                    shared.emit_close();
                }

                if let LoopExit::Cancelled = exit {
                    info!("Disconnected from {}", shared.config.url);
                    break;
                }
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", shared.config.url, e);
                if shared.is_current(generation) {
                    shared.emit_error(&e);
                }
                shared.set_state(generation, ReadyState::Closed);
                if shared.is_current(generation) {
                    shared.emit_close();
                }
            }
        }

        if !shared.wait_for_retry(&cancel).await {
            break;
        }
    }

    shared.set_state(generation, ReadyState::Closed);
}
