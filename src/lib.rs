//! # ws-session-pool
//!
//! Client-side WebSocket session management: authenticated connections,
//! message queueing, and automatic recovery for realtime applications.
//!
//! ## Features
//!
//! - **In-band authentication**: the bearer token travels in the first
//!   frame after socket open, never in the URL
//! - **Connection state machine**: disconnected, connecting,
//!   authenticating, connected, with every transition observable
//! - **Bounded message queueing**: messages sent while unreachable are
//!   buffered and flushed in order once the handshake completes
//! - **Automatic reconnection**: exponential backoff with a retry cap,
//!   suppressed entirely for intentional disconnects
//! - **Connection pooling**: independent named connections behind one
//!   credential provider
//! - **Reactive snapshots**: `watch`-based observers for UI layers and
//!   supervisors
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ws_session_pool::{ConnectionConfig, ConnectionPool, StaticToken};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ws_session_pool::Error> {
//!     let pool = ConnectionPool::new(Arc::new(StaticToken::new("api-key")));
//!
//!     let mut observer = pool
//!         .observe_connected(
//!             "simulation",
//!             Some(ConnectionConfig::with_url("wss://example.com/ws/simulation")),
//!         )
//!         .await?;
//!
//!     pool.send_json("simulation", &serde_json::json!({
//!         "type": "start_simulation",
//!         "scenario": "intake-01",
//!     }))?;
//!
//!     while let Some(snapshot) = observer.next().await {
//!         for frame in &snapshot.messages {
//!             println!("frame: {}", frame);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod auth;
mod config;
mod connection;
mod error;
mod events;
mod metrics;
mod pool;
mod protocol;
mod snapshot;
#[cfg(test)]
mod testutil;

pub use auth::{StaticToken, TokenProvider};
pub use config::{BackoffConfig, ConfigError, ConnectionConfig, ConnectionConfigBuilder, PoolConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Error, ErrorKind};
pub use events::{event, EventBus, EventPayload, EventSubscription};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::ConnectionPool;
pub use protocol::{
    AudioChunkHeader, SessionInfo, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT, CLOSE_NORMAL,
};
pub use snapshot::{ConnectionObserver, ConnectionSnapshot};

// Re-exported so callers construct frames without depending on
// tokio-tungstenite directly
pub use tokio_tungstenite::tungstenite::Message;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
