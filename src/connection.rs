use crate::auth::TokenProvider;
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::events::{event, EventBus, EventPayload, EventSubscription};
use crate::metrics::Metrics;
use crate::protocol::{self, AuthReply, SessionInfo};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

/// Lifecycle of a single logical connection.
///
/// The state is the single source of truth; every mutation fires a
/// [`event::STATE_CHANGE`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket; the initial and terminal state
    #[default]
    Disconnected,
    /// Dialing the server
    Connecting,
    /// Socket open, auth frame sent, awaiting the server's reply
    Authenticating,
    /// Handshake complete; application data flows
    Connected,
    /// Caller-initiated teardown in progress
    Disconnecting,
    /// Failed; auto-reconnect may be scheduled, otherwise terminal
    /// until `connect()` is called again
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Commands delivered to the connection task
#[derive(Debug)]
enum Command {
    Send(Message),
    Disconnect,
}

/// Buffer between callers and the connection task (matches the queue bound)
const COMMAND_CHANNEL_SIZE: usize = 100;

/// How long `disconnect()` waits for a graceful close before aborting
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Manages one physical WebSocket with an in-band auth handshake,
/// bounded outbound queueing, and exponential-backoff reconnection.
///
/// Outbound application data is only transmitted while the state is
/// [`ConnectionState::Connected`]; anything sent earlier is queued and
/// flushed in FIFO order once the handshake completes. Cloning shares
/// the underlying connection.
pub struct ConnectionManager<P: TokenProvider> {
    inner: Arc<Inner<P>>,
}

impl<P: TokenProvider> Clone for ConnectionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<P> {
    name: String,
    config: ConnectionConfig,
    provider: Arc<P>,
    events: EventBus,
    metrics: Arc<Metrics>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    session: Option<SessionInfo>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    intentional_disconnect: bool,
    queue: VecDeque<Message>,
    command_tx: Option<mpsc::Sender<Command>>,
    task: Option<JoinHandle<()>>,
    /// Incremented on every connect/disconnect so a straggling task from
    /// a previous lifecycle cannot mutate current state or fire a stale
    /// reconnect
    generation: u64,
}

enum SendOutcome {
    Dispatched,
    Queued(usize),
    Overflow,
}

/// Result of one connection attempt
enum AttemptOutcome {
    /// Caller-initiated stop; no reconnect
    Stopped,
    /// Auth rejection or timeout; connection stays in `Error` until the
    /// caller reconnects explicitly
    Fatal,
    /// Socket closed after a completed handshake
    Closed { code: u16, reason: String },
    /// Transport-level failure before or during the handshake
    Failed(Error),
}

/// What the handshake loop observed
enum AuthWait {
    Reply(AuthReply),
    Closed { code: u16 },
    Transport(tokio_tungstenite::tungstenite::Error),
    Ended,
}

/// Handshake wait, including caller interruption
enum HandshakeWait {
    Auth(AuthWait),
    Stopped,
}

impl<P: TokenProvider> ConnectionManager<P> {
    /// Create a new manager. No socket is opened until `connect()`.
    pub fn new(name: impl Into<String>, config: ConnectionConfig, provider: Arc<P>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                provider,
                events: EventBus::new(),
                metrics: Arc::new(Metrics::new()),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Disconnected,
                    session: None,
                    last_error: None,
                    reconnect_attempts: 0,
                    intentional_disconnect: false,
                    queue: VecDeque::new(),
                    command_tx: None,
                    task: None,
                    generation: 0,
                }),
            }),
        }
    }

    /// Logical name of this connection (used in log lines)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Whether the handshake has completed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Session details from the last successful handshake
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.shared.lock().session.clone()
    }

    /// Consecutive failed attempts; 0 after any successful auth
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().reconnect_attempts
    }

    /// Most recent error description, if any
    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.lock().last_error.clone()
    }

    /// Event bus for this connection
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register an event handler; shorthand for `events().on(..)`
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&EventPayload) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.inner.events.on(event, handler)
    }

    /// Metrics for this connection
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Open the connection and run the auth handshake.
    ///
    /// Idempotent: a no-op while already connecting, authenticating, or
    /// connected. Fetches a fresh token from the credential provider and
    /// spawns the connection task. Precondition failures (missing URL,
    /// no token) are returned directly; everything after the socket
    /// exists is reported through events.
    ///
    /// # Errors
    ///
    /// [`Error::MissingUrl`]/[`Error::InvalidUrl`] when the config has no
    /// usable URL, [`Error::Credential`] when the provider fails.
    pub async fn connect(&self) -> Result<(), Error> {
        if self.is_active() {
            debug!("[{}] connect() ignored, already {}", self.inner.name, self.state());
            return Ok(());
        }

        let url = self.inner.config.validated_url()?;
        let token = self.inner.provider.auth_token().await?;

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let generation = {
            let mut shared = self.inner.shared.lock();
            // Re-check under the lock: a concurrent connect() may have won
            // the race while we awaited the token
            if matches!(
                shared.state,
                ConnectionState::Connecting
                    | ConnectionState::Authenticating
                    | ConnectionState::Connected
            ) {
                return Ok(());
            }
            shared.generation += 1;
            shared.intentional_disconnect = false;
            shared.reconnect_attempts = 0;
            shared.last_error = None;
            shared.command_tx = Some(tx);
            shared.state = ConnectionState::Connecting;
            shared.generation
        };
        self.inner
            .events
            .emit(event::STATE_CHANGE, &EventPayload::State(ConnectionState::Connecting));

        let inner = self.inner.clone();
        let handle = tokio::spawn(run_loop(inner, generation, url, token, rx));
        self.inner.shared.lock().task = Some(handle);
        Ok(())
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Connected
        )
    }

    /// Tear the connection down.
    ///
    /// Sets the intentional-disconnect flag (suppressing the reconnect
    /// scheduler and cancelling any pending backoff or auth timer), closes
    /// the socket with code 1000, clears the session and queue, and resets
    /// the retry counter. Safe to call from any state.
    pub async fn disconnect(&self) {
        let (tx, task, was_active) = {
            let mut shared = self.inner.shared.lock();
            shared.intentional_disconnect = true;
            shared.generation += 1;
            shared.session = None;
            shared.queue.clear();
            shared.reconnect_attempts = 0;
            let was_active = shared.state != ConnectionState::Disconnected;
            (shared.command_tx.take(), shared.task.take(), was_active)
        };

        if was_active {
            self.force_state(ConnectionState::Disconnecting);
        }
        if let Some(tx) = tx {
            let _ = tx.send(Command::Disconnect).await;
        }
        if let Some(mut task) = task {
            if timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!("[{}] Connection task did not stop in time, aborting", self.inner.name);
                task.abort();
            }
        }
        self.force_state(ConnectionState::Disconnected);
    }

    /// Send a message, or queue it while not connected.
    ///
    /// Returns `false` only when the message was dropped because the
    /// bounded queue (or the in-flight channel) was full; a
    /// [`event::QUEUE_OVERFLOW`] event fires alongside. Never blocks.
    pub fn send(&self, message: Message) -> bool {
        let capacity = self.inner.config.queue_capacity;
        let outcome = {
            let mut shared = self.inner.shared.lock();
            if shared.state == ConnectionState::Connected {
                match shared.command_tx.clone() {
                    Some(tx) => match tx.try_send(Command::Send(message)) {
                        Ok(()) => SendOutcome::Dispatched,
                        // A full in-flight channel while connected is
                        // backpressure, not a buffering situation: queued
                        // messages would not flush until the next handshake
                        Err(TrySendError::Full(_)) => SendOutcome::Overflow,
                        Err(TrySendError::Closed(cmd)) => match cmd {
                            Command::Send(message) => enqueue(&mut shared, capacity, message),
                            Command::Disconnect => SendOutcome::Dispatched,
                        },
                    },
                    None => enqueue(&mut shared, capacity, message),
                }
            } else {
                enqueue(&mut shared, capacity, message)
            }
        };
        self.finish_send(outcome, capacity)
    }

    /// Serialize a value to JSON and send it.
    ///
    /// A serialization failure is a local error; nothing is queued.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] when the value cannot be encoded.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<bool, Error> {
        let text = serde_json::to_string(value)?;
        Ok(self.send(Message::Text(text)))
    }

    /// Send one audio chunk: a JSON metadata frame immediately followed by
    /// the raw bytes. The pair is dispatched or queued atomically so the
    /// metadata frame never travels without its payload.
    ///
    /// # Errors
    ///
    /// [`Error::Serialization`] when the header cannot be encoded.
    pub fn send_audio_chunk(
        &self,
        header: &protocol::AudioChunkHeader,
        data: Vec<u8>,
    ) -> Result<bool, Error> {
        let meta = Message::Text(header.to_frame()?);
        let body = Message::Binary(data);
        Ok(self.send_pair(meta, body))
    }

    fn send_pair(&self, first: Message, second: Message) -> bool {
        let capacity = self.inner.config.queue_capacity;
        let outcome = {
            let mut shared = self.inner.shared.lock();
            if shared.state == ConnectionState::Connected {
                match shared.command_tx.clone() {
                    Some(tx) if tx.capacity() >= 2 => {
                        // We hold the send-side lock, so both permits are ours
                        let _ = tx.try_send(Command::Send(first));
                        let _ = tx.try_send(Command::Send(second));
                        SendOutcome::Dispatched
                    }
                    Some(_) => SendOutcome::Overflow,
                    None => enqueue_pair(&mut shared, capacity, first, second),
                }
            } else {
                enqueue_pair(&mut shared, capacity, first, second)
            }
        };
        self.finish_send(outcome, capacity)
    }

    fn finish_send(&self, outcome: SendOutcome, capacity: usize) -> bool {
        match outcome {
            SendOutcome::Dispatched => true,
            SendOutcome::Queued(n) => {
                for _ in 0..n {
                    self.inner.metrics.record_message_queued();
                }
                true
            }
            SendOutcome::Overflow => {
                self.inner.metrics.record_queue_drop();
                let err = Error::QueueFull { capacity };
                warn!("[{}] Dropping message: {}", self.inner.name, err);
                self.inner
                    .events
                    .emit(event::QUEUE_OVERFLOW, &EventPayload::Error(err.to_string()));
                false
            }
        }
    }

    /// Transition regardless of task generation (caller-side paths)
    fn force_state(&self, next: ConnectionState) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == next {
                return;
            }
            trace!("[{}] {} -> {}", self.inner.name, shared.state, next);
            shared.state = next;
        }
        self.inner
            .events
            .emit(event::STATE_CHANGE, &EventPayload::State(next));
    }

    /// Abort the connection task without a graceful close. Used by the
    /// pool's Drop to avoid leaking tasks at teardown.
    pub(crate) fn abort(&self) {
        let (tx, task) = {
            let mut shared = self.inner.shared.lock();
            shared.intentional_disconnect = true;
            shared.generation += 1;
            (shared.command_tx.take(), shared.task.take())
        };
        drop(tx);
        if let Some(task) = task {
            task.abort();
        }
    }
}

fn enqueue(shared: &mut Shared, capacity: usize, message: Message) -> SendOutcome {
    if shared.queue.len() >= capacity {
        SendOutcome::Overflow
    } else {
        shared.queue.push_back(message);
        SendOutcome::Queued(1)
    }
}

fn enqueue_pair(
    shared: &mut Shared,
    capacity: usize,
    first: Message,
    second: Message,
) -> SendOutcome {
    if shared.queue.len() + 2 > capacity {
        SendOutcome::Overflow
    } else {
        shared.queue.push_back(first);
        shared.queue.push_back(second);
        SendOutcome::Queued(2)
    }
}

fn is_current<P>(inner: &Inner<P>, generation: u64) -> bool {
    inner.shared.lock().generation == generation
}

/// State transition on behalf of the connection task; ignored if the
/// task's lifecycle has been superseded
fn set_state<P>(inner: &Inner<P>, generation: u64, next: ConnectionState) {
    {
        let mut shared = inner.shared.lock();
        if shared.generation != generation || shared.state == next {
            return;
        }
        trace!("[{}] {} -> {}", inner.name, shared.state, next);
        shared.state = next;
    }
    inner.events.emit(event::STATE_CHANGE, &EventPayload::State(next));
}

fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

fn close_parts(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(f) => (u16::from(f.code), f.reason.into_owned()),
        // 1005: no status code present
        None => (1005, String::new()),
    }
}

/// Connection task: one iteration per physical connection attempt.
async fn run_loop<P: TokenProvider>(
    inner: Arc<Inner<P>>,
    generation: u64,
    url: String,
    first_token: SecretString,
    mut command_rx: mpsc::Receiver<Command>,
) {
    let mut token = Some(first_token);
    loop {
        // Fresh token on every attempt after the first; short-lived
        // credentials must survive reconnect cycles
        let attempt_token = match token.take() {
            Some(t) => t,
            None => match inner.provider.auth_token().await {
                Ok(t) => t,
                Err(e) => {
                    warn!("[{}] Token refresh failed: {}", inner.name, e);
                    report_failure(&inner, generation, &e.to_string());
                    set_state(&inner, generation, ConnectionState::Error);
                    if !schedule_reconnect(&inner, generation, &mut command_rx).await {
                        return;
                    }
                    continue;
                }
            },
        };

        match attempt(&inner, generation, &url, attempt_token, &mut command_rx).await {
            AttemptOutcome::Stopped => {
                finish_disconnected(&inner, generation);
                return;
            }
            AttemptOutcome::Fatal => {
                // State and events already recorded; the caller must
                // connect() again explicitly
                clear_channel(&inner, generation);
                return;
            }
            AttemptOutcome::Closed { code, reason } => {
                info!(
                    "[{}] Disconnected (code {}{})",
                    inner.name,
                    code,
                    if reason.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", reason)
                    }
                );
                {
                    let mut shared = inner.shared.lock();
                    if shared.generation != generation {
                        return;
                    }
                    shared.session = None;
                }
                set_state(&inner, generation, ConnectionState::Disconnected);
                inner
                    .events
                    .emit(event::DISCONNECTED, &EventPayload::Closed { code, reason });
                let intentional = inner.shared.lock().intentional_disconnect;
                if intentional || !inner.config.reconnect {
                    clear_channel(&inner, generation);
                    return;
                }
                if !schedule_reconnect(&inner, generation, &mut command_rx).await {
                    return;
                }
            }
            AttemptOutcome::Failed(e) => {
                inner.metrics.record_error();
                report_failure(&inner, generation, &e.to_string());
                set_state(&inner, generation, ConnectionState::Error);
                let intentional = inner.shared.lock().intentional_disconnect;
                if intentional {
                    finish_disconnected(&inner, generation);
                    return;
                }
                if !inner.config.reconnect {
                    clear_channel(&inner, generation);
                    return;
                }
                if !schedule_reconnect(&inner, generation, &mut command_rx).await {
                    return;
                }
            }
        }
    }
}

/// Record an error and surface it via events
fn report_failure<P>(inner: &Inner<P>, generation: u64, message: &str) {
    if !is_current(inner, generation) {
        return;
    }
    warn!("[{}] Connection error: {}", inner.name, message);
    inner.shared.lock().last_error = Some(message.to_string());
    inner
        .events
        .emit(event::ERROR, &EventPayload::Error(message.to_string()));
    inner
        .events
        .emit(event::CONNECTION_ERROR, &EventPayload::Error(message.to_string()));
}

/// Sleep out the backoff delay, watching for a disconnect command.
///
/// Returns `false` when the loop should stop (intentional disconnect or
/// retries exhausted). On `true` the state has moved back to Connecting.
async fn schedule_reconnect<P: TokenProvider>(
    inner: &Arc<Inner<P>>,
    generation: u64,
    command_rx: &mut mpsc::Receiver<Command>,
) -> bool {
    let attempts = {
        let shared = inner.shared.lock();
        if shared.generation != generation || shared.intentional_disconnect {
            return false;
        }
        shared.reconnect_attempts
    };
    let max = inner.config.max_reconnect_attempts;

    if attempts >= max {
        warn!("[{}] Max reconnect attempts ({}) reached, giving up", inner.name, max);
        let message = Error::MaxReconnectAttempts { attempts: max }.to_string();
        {
            let mut shared = inner.shared.lock();
            if shared.generation != generation {
                return false;
            }
            shared.last_error = Some(message.clone());
        }
        set_state(inner, generation, ConnectionState::Error);
        inner
            .events
            .emit(event::MAX_RECONNECT_ATTEMPTS, &EventPayload::Error(message));
        clear_channel(inner, generation);
        return false;
    }

    let delay = inner.config.backoff.delay_for_attempt(attempts);
    {
        let mut shared = inner.shared.lock();
        if shared.generation != generation {
            return false;
        }
        shared.reconnect_attempts = attempts + 1;
    }
    inner.metrics.record_reconnection();
    debug!(
        "[{}] Reconnecting in {:?} (attempt {}/{})",
        inner.name,
        delay,
        attempts + 1,
        max
    );
    inner.events.emit(
        event::RECONNECTING,
        &EventPayload::Reconnecting {
            attempt: attempts + 1,
            delay,
        },
    );

    // The backoff timer and the disconnect command race in the same
    // select, so a teardown during backoff can never leave a timer that
    // fires afterwards
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            cmd = command_rx.recv() => match cmd {
                Some(Command::Send(message)) => {
                    // Raced past a state flip; park it with the rest
                    let mut shared = inner.shared.lock();
                    let capacity = inner.config.queue_capacity;
                    let _ = enqueue(&mut shared, capacity, message);
                }
                Some(Command::Disconnect) | None => {
                    finish_disconnected(inner, generation);
                    return false;
                }
            },
        }
    }

    if !is_current(inner, generation) {
        return false;
    }
    set_state(inner, generation, ConnectionState::Connecting);
    true
}

/// Leave the task in the terminal Disconnected state
fn finish_disconnected<P>(inner: &Inner<P>, generation: u64) {
    {
        let mut shared = inner.shared.lock();
        if shared.generation != generation {
            return;
        }
        shared.session = None;
        shared.queue.clear();
        shared.reconnect_attempts = 0;
        shared.command_tx = None;
        shared.task = None;
    }
    set_state(inner, generation, ConnectionState::Disconnected);
}

/// Drop the command channel without touching state (Error is sticky)
fn clear_channel<P>(inner: &Inner<P>, generation: u64) {
    let mut shared = inner.shared.lock();
    if shared.generation != generation {
        return;
    }
    shared.command_tx = None;
    shared.task = None;
}

/// One full connection attempt: dial, handshake, then the message loop.
async fn attempt<P: TokenProvider>(
    inner: &Arc<Inner<P>>,
    generation: u64,
    url: &str,
    token: SecretString,
    command_rx: &mut mpsc::Receiver<Command>,
) -> AttemptOutcome {
    debug!("[{}] Connecting to {}", inner.name, url);

    let ws = match timeout(inner.config.connect_timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => return AttemptOutcome::Failed(Error::WebSocket(e)),
        Err(_) => {
            return AttemptOutcome::Failed(Error::ConnectFailed {
                last_error: format!("connect timeout after {:?}", inner.config.connect_timeout),
            })
        }
    };

    inner.metrics.record_connection();
    info!("[{}] Socket open to {}", inner.name, url);
    let (mut write, mut read) = ws.split();

    if inner.shared.lock().intentional_disconnect {
        let _ = write.send(close_frame(protocol::CLOSE_NORMAL, "client disconnect")).await;
        return AttemptOutcome::Stopped;
    }

    set_state(inner, generation, ConnectionState::Authenticating);

    // The auth frame is the first thing on the wire, always
    if let Err(e) = write.send(Message::Text(protocol::auth_frame(&token))).await {
        return AttemptOutcome::Failed(Error::WebSocket(e));
    }
    drop(token);

    // The command channel races the auth reply so an intentional
    // disconnect interrupts the handshake instead of waiting it out
    let handshake = async {
        tokio::select! {
            wait = await_auth_reply(inner, &mut write, &mut read) => HandshakeWait::Auth(wait),
            _ = drain_until_disconnect(inner, command_rx) => HandshakeWait::Stopped,
        }
    };

    let session = match timeout(inner.config.auth_timeout, handshake).await {
        Ok(HandshakeWait::Stopped) => {
            let _ = write
                .send(close_frame(protocol::CLOSE_NORMAL, "client disconnect"))
                .await;
            return AttemptOutcome::Stopped;
        }
        Err(_elapsed) => {
            warn!(
                "[{}] No auth reply within {:?}",
                inner.name, inner.config.auth_timeout
            );
            inner.metrics.record_auth_timeout();
            if is_current(inner, generation) {
                let err = Error::AuthTimeout;
                inner.shared.lock().last_error = Some(err.to_string());
                inner.events.emit(
                    event::AUTHENTICATION_TIMEOUT,
                    &EventPayload::Error(err.to_string()),
                );
            }
            let _ = write
                .send(close_frame(protocol::CLOSE_AUTH_TIMEOUT, "authentication timeout"))
                .await;
            set_state(inner, generation, ConnectionState::Error);
            return AttemptOutcome::Fatal;
        }
        Ok(HandshakeWait::Auth(AuthWait::Reply(AuthReply::Error { error }))) => {
            warn!(
                "[{}] {}",
                inner.name,
                Error::AuthRejected {
                    reason: error.clone()
                }
            );
            inner.metrics.record_auth_failure();
            if is_current(inner, generation) {
                inner.shared.lock().last_error = Some(error.clone());
                inner
                    .events
                    .emit(event::AUTHENTICATION_ERROR, &EventPayload::Error(error));
            }
            let _ = write
                .send(close_frame(protocol::CLOSE_AUTH_FAILED, "authentication failed"))
                .await;
            set_state(inner, generation, ConnectionState::Error);
            return AttemptOutcome::Fatal;
        }
        Ok(HandshakeWait::Auth(AuthWait::Reply(AuthReply::Success {
            session_id,
            user_id,
            timestamp,
        }))) => SessionInfo {
            session_id,
            user_id,
            timestamp,
        },
        Ok(HandshakeWait::Auth(AuthWait::Closed { code })) => {
            return AttemptOutcome::Failed(Error::ConnectFailed {
                last_error: format!("closed during authentication (code {})", code),
            })
        }
        Ok(HandshakeWait::Auth(AuthWait::Transport(e))) => {
            return AttemptOutcome::Failed(Error::WebSocket(e))
        }
        Ok(HandshakeWait::Auth(AuthWait::Ended)) => {
            return AttemptOutcome::Failed(Error::ConnectFailed {
                last_error: "stream ended during authentication".to_string(),
            })
        }
    };

    info!(
        "[{}] Authenticated (session {})",
        inner.name, session.session_id
    );
    {
        let mut shared = inner.shared.lock();
        if shared.generation != generation {
            return AttemptOutcome::Stopped;
        }
        shared.session = Some(session.clone());
        // Reset only on successful auth, never on mere socket open
        shared.reconnect_attempts = 0;
        shared.last_error = None;
    }
    set_state(inner, generation, ConnectionState::Connected);
    inner
        .events
        .emit(event::CONNECTED, &EventPayload::Session(session));

    // Flush everything queued while unreachable, in FIFO order, before
    // any live sends are processed
    loop {
        let next = inner.shared.lock().queue.pop_front();
        match next {
            None => break,
            Some(message) => {
                if let Err(e) = write.send(message).await {
                    return unclean_close(inner, generation, e);
                }
                inner.metrics.record_message_sent();
            }
        }
    }

    // Steady state: inbound frames and caller commands on one loop
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_text(inner, &text),
                Some(Ok(Message::Binary(bytes))) => {
                    inner.metrics.record_message_received();
                    inner
                        .events
                        .emit(event::BINARY_MESSAGE, &EventPayload::Binary(bytes));
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        return unclean_close(inner, generation, e);
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_parts(frame);
                    return AttemptOutcome::Closed { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return unclean_close(inner, generation, e),
                None => return AttemptOutcome::Closed { code: 1006, reason: String::new() },
            },
            cmd = command_rx.recv() => match cmd {
                Some(Command::Send(message)) => {
                    if let Err(e) = write.send(message).await {
                        return unclean_close(inner, generation, e);
                    }
                    inner.metrics.record_message_sent();
                }
                Some(Command::Disconnect) | None => {
                    let _ = write
                        .send(close_frame(protocol::CLOSE_NORMAL, "client disconnect"))
                        .await;
                    return AttemptOutcome::Stopped;
                }
            },
        }
    }
}

/// A transport failure after the handshake is an abnormal closure: it is
/// surfaced as an error and then follows the normal close-triggered path
/// (disconnected, then reconnect if enabled)
fn unclean_close<P>(
    inner: &Inner<P>,
    generation: u64,
    e: tokio_tungstenite::tungstenite::Error,
) -> AttemptOutcome {
    report_failure(inner, generation, &e.to_string());
    inner.metrics.record_error();
    AttemptOutcome::Closed {
        code: 1006,
        reason: e.to_string(),
    }
}

/// Park stray sends and resolve once the caller asks for teardown (or
/// the channel is gone)
async fn drain_until_disconnect<P>(inner: &Inner<P>, command_rx: &mut mpsc::Receiver<Command>) {
    loop {
        match command_rx.recv().await {
            Some(Command::Send(message)) => {
                let capacity = inner.config.queue_capacity;
                let mut shared = inner.shared.lock();
                let _ = enqueue(&mut shared, capacity, message);
            }
            Some(Command::Disconnect) | None => return,
        }
    }
}

/// Read frames until the server answers the handshake.
///
/// Non-auth frames arriving before auth completes are dropped without
/// delivery; the server may not rely on redelivery.
async fn await_auth_reply<P>(inner: &Inner<P>, write: &mut WsSink, read: &mut WsSource) -> AuthWait {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<AuthReply>(&text) {
                Ok(reply) => return AuthWait::Reply(reply),
                Err(_) => {
                    trace!("[{}] Dropping pre-auth frame", inner.name);
                }
            },
            Ok(Message::Ping(data)) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    return AuthWait::Ended;
                }
            }
            Ok(Message::Close(frame)) => {
                let (code, _) = close_parts(frame);
                return AuthWait::Closed { code };
            }
            Ok(_) => {
                trace!("[{}] Dropping pre-auth frame", inner.name);
            }
            Err(e) => return AuthWait::Transport(e),
        }
    }
    AuthWait::Ended
}

/// Parse and dispatch one inbound text frame
fn handle_text<P>(inner: &Inner<P>, text: &str) {
    inner.metrics.record_message_received();
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            let kind = protocol::frame_type(&value).map(str::to_owned);
            let payload = EventPayload::Frame(value);
            inner.events.emit(event::MESSAGE, &payload);
            // Type-specific fan-out under the frame's own discriminator
            if let Some(kind) = kind {
                inner.events.emit(&kind, &payload);
            }
        }
        Err(e) => {
            debug!("[{}] Unparseable frame: {}", inner.name, e);
            inner
                .events
                .emit(event::ERROR, &EventPayload::Error(format!("invalid frame: {}", e)));
        }
    }
}
