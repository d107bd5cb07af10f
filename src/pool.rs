use crate::auth::TokenProvider;
use crate::config::{ConnectionConfig, PoolConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::Error;
use crate::events::{event, EventPayload, EventSubscription};
use crate::metrics::Metrics;
use crate::snapshot::{ConnectionObserver, ConnectionSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// A registry of independent connections keyed by logical name
/// ("simulation", "voice", ...).
///
/// All connections share one credential provider but fail and reconnect
/// independently. The pool also maintains one snapshot channel per name
/// for reactive observers; observers stay attached across
/// disconnect/reconnect cycles of the same name.
pub struct ConnectionPool<P: TokenProvider> {
    provider: Arc<P>,
    config: PoolConfig,
    entries: RwLock<HashMap<String, PoolEntry<P>>>,
    watchers: RwLock<HashMap<String, Arc<watch::Sender<ConnectionSnapshot>>>>,
    next_epoch: AtomicU64,
}

struct PoolEntry<P: TokenProvider> {
    manager: ConnectionManager<P>,
    channel: Arc<RwLock<ChannelState>>,
    epoch: u64,
}

/// Accumulated observable state for one connection name
#[derive(Default)]
struct ChannelState {
    state: ConnectionState,
    messages: Vec<serde_json::Value>,
    error: Option<String>,
}

impl<P: TokenProvider> ConnectionPool<P> {
    /// Create a pool with no per-name defaults
    pub fn new(provider: Arc<P>) -> Self {
        Self::with_config(provider, PoolConfig::new())
    }

    /// Create a pool with per-name default configurations
    pub fn with_config(provider: Arc<P>, config: PoolConfig) -> Self {
        Self {
            provider,
            config,
            entries: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Open (or re-open) the named connection.
    ///
    /// Configuration resolves in order: the explicit `config` argument,
    /// the pool's per-name defaults, then the `WS_URL_<NAME>` environment
    /// variable. With none of the three, [`Error::NotConfigured`] is
    /// returned. Calling connect for a name that is already connecting or
    /// connected is a no-op.
    pub async fn connect(&self, name: &str, config: Option<ConnectionConfig>) -> Result<(), Error> {
        let manager = {
            let mut entries = self.entries.write();
            match entries.get(name) {
                Some(entry) => {
                    if config.is_some() {
                        warn!(
                            "[pool] connect(\"{}\"): connection already exists, ignoring the \
                             provided config (disconnect first to reconfigure)",
                            name
                        );
                    }
                    entry.manager.clone()
                }
                None => {
                    let resolved = config
                        .or_else(|| self.config.default_for(name).cloned())
                        .or_else(|| ConnectionConfig::from_env(name))
                        .ok_or_else(|| Error::NotConfigured {
                            name: name.to_string(),
                        })?;
                    let manager =
                        ConnectionManager::new(name, resolved, self.provider.clone());
                    let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
                    let channel = Arc::new(RwLock::new(ChannelState::default()));
                    wire_events(&manager, channel.clone(), self.watcher_for(name), epoch);
                    debug!("[pool] Registered connection \"{}\" (epoch {})", name, epoch);
                    entries.insert(
                        name.to_string(),
                        PoolEntry {
                            manager: manager.clone(),
                            channel,
                            epoch,
                        },
                    );
                    manager
                }
            }
        };

        let result = manager.connect().await;
        if let Err(e) = &result {
            // Pre-socket failures never reach the event bus; reflect them
            // into the snapshot so observers are not left waiting
            if let Some(entry) = self.entries.read().get(name) {
                entry.channel.write().error = Some(e.to_string());
            }
            self.publish(name);
        }
        result
    }

    /// Close the named connection and drop it from the pool.
    ///
    /// A no-op for unknown names. Observers remain subscribed and see a
    /// final disconnected snapshot.
    pub async fn disconnect(&self, name: &str) {
        let entry = self.entries.write().remove(name);
        if let Some(entry) = entry {
            info!("[pool] Disconnecting \"{}\"", name);
            entry.manager.disconnect().await;
        }
    }

    /// Close every connection in the pool
    pub async fn disconnect_all(&self) {
        let names: Vec<String> = self.entries.read().keys().cloned().collect();
        for name in names {
            self.disconnect(&name).await;
        }
    }

    /// Send on the named connection; queues while not connected.
    ///
    /// Returns `false` for unknown names and for messages dropped by the
    /// bounded queue.
    pub fn send(&self, name: &str, message: Message) -> bool {
        match self.manager(name) {
            Some(manager) => manager.send(message),
            None => {
                warn!("[pool] send to unknown connection \"{}\"", name);
                false
            }
        }
    }

    /// Serialize a value to JSON and send it on the named connection.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] when the value cannot be encoded.
    pub fn send_json<T: Serialize>(&self, name: &str, value: &T) -> Result<bool, Error> {
        match self.manager(name) {
            Some(manager) => manager.send_json(value),
            None => Ok(false),
        }
    }

    /// Current state of the named connection; Disconnected when unknown
    pub fn connection_state(&self, name: &str) -> ConnectionState {
        self.manager(name)
            .map(|m| m.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Whether the named connection has completed its handshake
    pub fn is_connected(&self, name: &str) -> bool {
        self.connection_state(name) == ConnectionState::Connected
    }

    /// Application frames received on the named connection, oldest first
    pub fn messages(&self, name: &str) -> Vec<serde_json::Value> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.channel.read().messages.clone())
            .unwrap_or_default()
    }

    /// Discard accumulated frames for the named connection
    pub fn clear_messages(&self, name: &str) {
        if let Some(entry) = self.entries.read().get(name) {
            entry.channel.write().messages.clear();
        }
        self.publish(name);
    }

    /// Latest error for the named connection, if any
    pub fn error(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .get(name)
            .and_then(|e| e.channel.read().error.clone())
    }

    /// Register an event handler on the named connection.
    ///
    /// Returns `None` when the name is not in the pool; subscribe after
    /// `connect()` or use [`ConnectionPool::observe`], which works before
    /// the connection exists.
    pub fn subscribe(
        &self,
        name: &str,
        event: &str,
        handler: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> Option<EventSubscription> {
        match self.manager(name) {
            Some(manager) => Some(manager.subscribe(event, handler)),
            None => {
                warn!("[pool] subscribe on unknown connection \"{}\"", name);
                None
            }
        }
    }

    /// Snapshot observer for the named connection.
    ///
    /// Works before the connection exists; the observer starts from an
    /// empty disconnected snapshot and updates once `connect()` runs.
    pub fn observe(&self, name: &str) -> ConnectionObserver {
        ConnectionObserver::new(self.watcher_for(name).subscribe())
    }

    /// Connect (if needed) and return an observer in one step
    pub async fn observe_connected(
        &self,
        name: &str,
        config: Option<ConnectionConfig>,
    ) -> Result<ConnectionObserver, Error> {
        self.connect(name, config).await?;
        Ok(self.observe(name))
    }

    /// Metrics for the named connection
    pub fn metrics(&self, name: &str) -> Option<Arc<Metrics>> {
        self.manager(name).map(|m| m.metrics())
    }

    /// Names currently registered in the pool
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn manager(&self, name: &str) -> Option<ConnectionManager<P>> {
        self.entries.read().get(name).map(|e| e.manager.clone())
    }

    fn watcher_for(&self, name: &str) -> Arc<watch::Sender<ConnectionSnapshot>> {
        if let Some(tx) = self.watchers.read().get(name) {
            return tx.clone();
        }
        let mut watchers = self.watchers.write();
        watchers
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(ConnectionSnapshot::default());
                Arc::new(tx)
            })
            .clone()
    }

    fn publish(&self, name: &str) {
        let Some((channel, epoch)) = self
            .entries
            .read()
            .get(name)
            .map(|e| (e.channel.clone(), e.epoch))
        else {
            return;
        };
        let Some(tx) = self.watchers.read().get(name).cloned() else {
            return;
        };
        let snap = {
            let ch = channel.read();
            ConnectionSnapshot {
                state: ch.state,
                messages: ch.messages.clone(),
                error: ch.error.clone(),
                epoch,
            }
        };
        tx.send_replace(snap);
    }
}

impl<P: TokenProvider> Drop for ConnectionPool<P> {
    fn drop(&mut self) {
        // Tasks must not outlive the pool; no graceful close at this point
        for entry in self.entries.get_mut().values() {
            entry.manager.abort();
        }
    }
}

/// Mirror a manager's events into the shared channel state and push a
/// fresh snapshot after every change.
fn wire_events<P: TokenProvider>(
    manager: &ConnectionManager<P>,
    channel: Arc<RwLock<ChannelState>>,
    watcher: Arc<watch::Sender<ConnectionSnapshot>>,
    epoch: u64,
) {
    let publish: Arc<dyn Fn() + Send + Sync> = {
        let channel = channel.clone();
        Arc::new(move || {
            let snap = {
                let ch = channel.read();
                ConnectionSnapshot {
                    state: ch.state,
                    messages: ch.messages.clone(),
                    error: ch.error.clone(),
                    epoch,
                }
            };
            watcher.send_replace(snap);
        })
    };

    {
        let channel = channel.clone();
        let publish = publish.clone();
        manager.subscribe(event::STATE_CHANGE, move |p| {
            if let EventPayload::State(s) = p {
                channel.write().state = *s;
            }
            publish();
        });
    }
    {
        let channel = channel.clone();
        let publish = publish.clone();
        manager.subscribe(event::CONNECTED, move |_| {
            channel.write().error = None;
            publish();
        });
    }
    {
        let channel = channel.clone();
        let publish = publish.clone();
        manager.subscribe(event::MESSAGE, move |p| {
            if let EventPayload::Frame(v) = p {
                channel.write().messages.push(v.clone());
            }
            publish();
        });
    }
    for error_event in [
        event::ERROR,
        event::CONNECTION_ERROR,
        event::AUTHENTICATION_ERROR,
        event::AUTHENTICATION_TIMEOUT,
        event::MAX_RECONNECT_ATTEMPTS,
    ] {
        let channel = channel.clone();
        let publish = publish.clone();
        manager.subscribe(error_event, move |p| {
            if let EventPayload::Error(e) = p {
                channel.write().error = Some(e.clone());
            }
            publish();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::testutil::{wait_until, AuthMode, TestServer};
    use std::time::Duration;

    fn pool() -> ConnectionPool<StaticToken> {
        ConnectionPool::new(Arc::new(StaticToken::new("tok-1")))
    }

    fn config_for(url: &str) -> ConnectionConfig {
        ConnectionConfig::with_url(url)
    }

    #[tokio::test]
    async fn test_unknown_name_without_config_fails() {
        let pool = pool();
        let err = pool
            .connect("no_such_connection_configured", None)
            .await
            .expect_err("nothing resolvable");
        assert!(matches!(err, Error::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_connect_and_send_through_pool() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("connect");
        assert!(wait_until(|| pool.is_connected("simulation")).await);

        assert!(pool.send("simulation", Message::Text("hello".into())));
        assert!(wait_until(|| !server.state.frames.lock().is_empty()).await);
        assert_eq!(server.state.frames.lock()[0], "hello");
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let good = TestServer::spawn(AuthMode::Accept).await;
        let bad = TestServer::spawn(AuthMode::Reject("bad token")).await;
        let pool = pool();

        pool.connect("voice", Some(config_for(&good.url)))
            .await
            .expect("connect voice");
        pool.connect("simulation", Some(config_for(&bad.url)))
            .await
            .expect("connect simulation");

        assert!(wait_until(|| pool.is_connected("voice")).await);
        assert!(
            wait_until(|| pool.connection_state("simulation") == ConnectionState::Error).await
        );

        // The failing connection does not disturb the healthy one
        assert!(pool.is_connected("voice"));
        assert_eq!(pool.error("simulation").as_deref(), Some("bad token"));
        assert!(pool.error("voice").is_none());
    }

    #[tokio::test]
    async fn test_messages_accumulate_and_clear() {
        let server = TestServer::spawn(AuthMode::AcceptThenSend(vec![
            r#"{"type":"a","n":1}"#,
            r#"{"type":"b","n":2}"#,
        ]))
        .await;
        let pool = pool();

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("connect");
        assert!(wait_until(|| pool.messages("simulation").len() == 2).await);

        let messages = pool.messages("simulation");
        assert_eq!(messages[0]["n"], 1);
        assert_eq!(messages[1]["n"], 2);

        pool.clear_messages("simulation");
        assert!(pool.messages("simulation").is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_lifecycle() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();

        // Observing before the connection exists is allowed
        let mut observer = pool.observe("simulation");
        assert_eq!(observer.snapshot().state, ConnectionState::Disconnected);

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("connect");
        let snap = observer
            .wait_for(|s| s.is_connected())
            .await
            .expect("pool alive");
        assert_eq!(snap.epoch, 1);

        pool.disconnect("simulation").await;
        let snap = observer
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .expect("pool alive");
        assert!(!snap.is_connected());
    }

    #[tokio::test]
    async fn test_epoch_bumps_across_reconnect_cycles() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();
        let mut observer = pool.observe("simulation");

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("first connect");
        let first = observer
            .wait_for(|s| s.is_connected())
            .await
            .expect("pool alive");

        pool.disconnect("simulation").await;
        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("second connect");
        let second = observer
            .wait_for(|s| s.is_connected())
            .await
            .expect("pool alive");

        assert!(second.epoch > first.epoch);
        // A fresh lifecycle starts with an empty message buffer
        assert!(second.messages.is_empty());
    }

    #[tokio::test]
    async fn test_pool_connect_is_idempotent() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("connect");
        assert!(wait_until(|| pool.is_connected("simulation")).await);
        pool.connect("simulation", None).await.expect("no-op");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.state.accepts(), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_name() {
        let pool = pool();
        assert!(!pool.send("nope", Message::Text("x".into())));
        assert_eq!(
            pool.send_json("nope", &serde_json::json!({"a": 1}))
                .expect("serializes"),
            false
        );
        assert!(pool.messages("nope").is_empty());
        assert_eq!(pool.connection_state("nope"), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_pool_defaults_resolve_config() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = ConnectionPool::with_config(
            Arc::new(StaticToken::new("tok-1")),
            PoolConfig::new().with_default("simulation", config_for(&server.url)),
        );

        pool.connect("simulation", None).await.expect("connect");
        assert!(wait_until(|| pool.is_connected("simulation")).await);
    }

    #[tokio::test]
    async fn test_subscribe_through_pool() {
        let server = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();

        assert!(pool.subscribe("simulation", event::CONNECTED, |_| {}).is_none());

        pool.connect("simulation", Some(config_for(&server.url)))
            .await
            .expect("connect");
        let hits = Arc::new(parking_lot::Mutex::new(0u32));
        {
            let hits = hits.clone();
            pool.subscribe("simulation", event::STATE_CHANGE, move |_| {
                *hits.lock() += 1;
            })
            .expect("connection exists");
        }

        assert!(wait_until(|| pool.is_connected("simulation")).await);
        pool.disconnect("simulation").await;
        assert!(wait_until(|| *hits.lock() > 0).await);
    }

    #[tokio::test]
    async fn test_existing_entry_keeps_original_config() {
        let original = TestServer::spawn(AuthMode::Accept).await;
        let other = TestServer::spawn(AuthMode::Accept).await;
        let pool = pool();

        pool.connect("simulation", Some(config_for(&original.url)))
            .await
            .expect("connect");
        assert!(wait_until(|| pool.is_connected("simulation")).await);

        // A config passed for a live entry is ignored, not applied
        pool.connect("simulation", Some(config_for(&other.url)))
            .await
            .expect("no-op");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(original.state.accepts(), 1);
        assert_eq!(other.state.accepts(), 0);

        // Reconfiguring requires removing the entry first
        pool.disconnect("simulation").await;
        pool.connect("simulation", Some(config_for(&other.url)))
            .await
            .expect("reconnect");
        assert!(wait_until(|| other.state.accepts() == 1).await);
    }
}
