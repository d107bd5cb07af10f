//! In-process WebSocket server for exercising the full handshake over a
//! real socket. Accepts repeatedly so reconnect behavior can be observed.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How the server answers the client's auth frame
#[derive(Clone)]
pub enum AuthMode {
    /// Reply with auth_success
    Accept,
    /// Reply with auth_error carrying the given reason
    Reject(&'static str),
    /// Never reply; the client must enforce its own deadline
    Silent,
    /// Accept, then drop the first connection abruptly (no close frame);
    /// subsequent connections behave like `Accept`
    AcceptDropFirst,
    /// Accept, then push the given text frames to the client
    AcceptThenSend(Vec<&'static str>),
}

/// Everything the server observed, for assertions
#[derive(Default)]
pub struct ServerState {
    accepted: AtomicUsize,
    /// First text frame of each connection (the auth frame)
    pub first_frames: Mutex<Vec<String>>,
    /// Post-auth text frames, across all connections, in arrival order
    pub frames: Mutex<Vec<String>>,
    /// Post-auth binary frames
    pub binaries: Mutex<Vec<Vec<u8>>>,
    /// Close codes received from the client
    pub closes: Mutex<Vec<u16>>,
}

impl ServerState {
    pub fn accepts(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub struct TestServer {
    pub url: String,
    pub state: Arc<ServerState>,
}

/// Honors `RUST_LOG`; safe to call from every test
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl TestServer {
    pub async fn spawn(mode: AuthMode) -> Self {
        Self::spawn_on(0, mode).await
    }

    /// Bind a specific port. Combined with [`free_port`], this lets a
    /// test bring a server up at an address a client already dialed.
    pub async fn spawn_on(port: u16, mode: AuthMode) -> Self {
        init_tracing();
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = accept_state.accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let state = accept_state.clone();
                let mode = mode.clone();
                tokio::spawn(handle(stream, state, mode, n));
            }
        });

        Self {
            url: format!("ws://{}", addr),
            state,
        }
    }
}

async fn handle(stream: TcpStream, state: Arc<ServerState>, mode: AuthMode, accept_no: usize) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    // The first text frame of every connection is the client's auth frame
    let first = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    state.first_frames.lock().push(first);

    match &mode {
        AuthMode::Silent => {
            read_rest(&mut ws, &state).await;
            return;
        }
        AuthMode::Reject(reason) => {
            let reply = format!(r#"{{"type":"auth_error","error":"{}"}}"#, reason);
            let _ = ws.send(Message::Text(reply)).await;
            read_rest(&mut ws, &state).await;
            return;
        }
        _ => {}
    }

    let reply = format!(
        r#"{{"type":"auth_success","session_id":"s1","user_id":"u1","timestamp":"t{}"}}"#,
        accept_no
    );
    if ws.send(Message::Text(reply)).await.is_err() {
        return;
    }

    if matches!(&mode, AuthMode::AcceptDropFirst) && accept_no == 1 {
        // Let the auth reply flush, then vanish without a close frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        return;
    }

    if let AuthMode::AcceptThenSend(frames) = &mode {
        for frame in frames {
            if ws.send(Message::Text((*frame).to_string())).await.is_err() {
                return;
            }
        }
    }

    read_rest(&mut ws, &state).await;
}

async fn read_rest(ws: &mut WebSocketStream<TcpStream>, state: &ServerState) {
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => state.frames.lock().push(text),
            Message::Binary(bytes) => state.binaries.lock().push(bytes),
            Message::Close(frame) => {
                if let Some(f) = frame {
                    state.closes.lock().push(u16::from(f.code));
                }
                return;
            }
            Message::Ping(data) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }
}

/// A local port with nothing listening on it (until someone binds it)
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Poll a condition until it holds or five seconds elapse
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
