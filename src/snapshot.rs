//! Reactive view over a pooled connection.
//!
//! A [`ConnectionObserver`] receives a coalesced [`ConnectionSnapshot`]
//! whenever anything about the connection changes. Slow observers never
//! block the connection; they simply see the latest snapshot when they
//! catch up.

use crate::connection::ConnectionState;
use tokio::sync::watch;

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    /// Current lifecycle state
    pub state: ConnectionState,
    /// Parsed application frames received since the observer's channel
    /// was created, oldest first
    pub messages: Vec<serde_json::Value>,
    /// Most recent error, cleared when a handshake completes
    pub error: Option<String>,
    /// Identifies the connection lifecycle; bumps when a name is
    /// reconnected so observers can distinguish a fresh session from a
    /// stale one
    pub epoch: u64,
}

impl ConnectionSnapshot {
    /// Whether the handshake has completed for this lifecycle
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Receives snapshots for one connection name.
///
/// Observers outlive individual connections: disconnecting and
/// reconnecting a name keeps existing observers attached, with the
/// snapshot's `epoch` marking the new lifecycle.
#[derive(Clone)]
pub struct ConnectionObserver {
    rx: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionObserver {
    pub(crate) fn new(rx: watch::Receiver<ConnectionSnapshot>) -> Self {
        Self { rx }
    }

    /// Latest snapshot without waiting
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the resulting snapshot.
    ///
    /// Returns `None` once the pool (and with it the sending side) has
    /// been dropped.
    pub async fn next(&mut self) -> Option<ConnectionSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until a snapshot satisfies the predicate.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&ConnectionSnapshot) -> bool,
    ) -> Option<ConnectionSnapshot> {
        {
            let current = self.rx.borrow_and_update().clone();
            if pred(&current) {
                return Some(current);
            }
        }
        loop {
            self.rx.changed().await.ok()?;
            let snap = self.rx.borrow_and_update().clone();
            if pred(&snap) {
                return Some(snap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_and_next() {
        let (tx, rx) = watch::channel(ConnectionSnapshot::default());
        let mut observer = ConnectionObserver::new(rx);

        assert_eq!(observer.snapshot().state, ConnectionState::Disconnected);
        assert!(!observer.snapshot().is_connected());

        tx.send_replace(ConnectionSnapshot {
            state: ConnectionState::Connected,
            epoch: 1,
            ..Default::default()
        });
        let snap = observer.next().await.expect("sender alive");
        assert!(snap.is_connected());
        assert_eq!(snap.epoch, 1);
    }

    #[tokio::test]
    async fn test_next_ends_when_sender_dropped() {
        let (tx, rx) = watch::channel(ConnectionSnapshot::default());
        let mut observer = ConnectionObserver::new(rx);
        drop(tx);
        assert!(observer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_returns_immediately_on_match() {
        let (tx, rx) = watch::channel(ConnectionSnapshot {
            state: ConnectionState::Connected,
            ..Default::default()
        });
        let mut observer = ConnectionObserver::new(rx);
        let snap = observer.wait_for(|s| s.is_connected()).await;
        assert!(snap.is_some());
        drop(tx);
    }
}
