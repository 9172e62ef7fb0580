//! Connection hub: per-connection write queues and the user → connections
//! index used for publish fan-out.
//!
//! A connection is served by three tasks (reader, writer, close watcher)
//! owned by the router; the hub only tracks handles. The write queue is
//! bounded: a router write that cannot enqueue within the write timeout
//! trips the close signal so a stalled client is torn down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn};

use crate::rpc::auth::AuthSession;

pub const WRITE_QUEUE_SIZE: usize = 256;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("connection {0} already registered")]
    Duplicate(String),
}

pub struct Connection {
    pub id: String,
    user_id: RwLock<String>,
    write_tx: mpsc::Sender<String>,
    close_tx: watch::Sender<bool>,
    write_timeout: Duration,
    /// Authenticated policy bound to this connection, if any.
    pub auth: Mutex<Option<AuthSession>>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        write_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<String>, watch::Receiver<bool>) {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            id: id.into(),
            user_id: RwLock::new(String::new()),
            write_tx,
            close_tx,
            write_timeout,
            auth: Mutex::new(None),
        });
        (conn, write_rx, close_rx)
    }

    pub async fn user_id(&self) -> String {
        self.user_id.read().await.clone()
    }

    pub async fn set_user_id(&self, user: &str) {
        *self.user_id.write().await = user.to_string();
    }

    /// Enqueue a frame for the writer. Blocks at most the write timeout; on
    /// timeout the close signal fires and the connection is torn down.
    pub async fn write(&self, frame: String) {
        if frame.is_empty() {
            return;
        }
        match tokio::time::timeout(self.write_timeout, self.write_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Writer already gone; the close watcher handles teardown.
            }
            Err(_) => {
                warn!(conn_id = %self.id, "write queue stalled, closing connection");
                let _ = self.close_tx.send(true);
            }
        }
    }

    /// Best-effort enqueue used by publish fan-out; never blocks.
    pub fn try_write(&self, frame: String) -> bool {
        if frame.is_empty() {
            return false;
        }
        self.write_tx.try_send(frame).is_ok()
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    by_user: RwLock<HashMap<String, HashSet<String>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&conn.id) {
            return Err(HubError::Duplicate(conn.id.clone()));
        }
        connections.insert(conn.id.clone(), conn);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) {
        let removed = self.connections.write().await.remove(id);
        if let Some(conn) = removed {
            let user = conn.user_id().await;
            if !user.is_empty() {
                let mut by_user = self.by_user.write().await;
                if let Some(ids) = by_user.get_mut(&user) {
                    ids.remove(id);
                    if ids.is_empty() {
                        by_user.remove(&user);
                    }
                }
            }
        }
    }

    /// Rebind a connection to a user, dropping any previous binding.
    pub async fn reauthenticate(&self, id: &str, user: &str) {
        let Some(conn) = self.get(id).await else {
            return;
        };
        let previous = conn.user_id().await;
        conn.set_user_id(user).await;

        let mut by_user = self.by_user.write().await;
        if !previous.is_empty() {
            if let Some(ids) = by_user.get_mut(&previous) {
                ids.remove(id);
                if ids.is_empty() {
                    by_user.remove(&previous);
                }
            }
        }
        by_user
            .entry(user.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Fan a frame out to every connection of a user. Best effort: full
    /// queues drop the frame for that connection.
    pub async fn publish(&self, user: &str, frame: &str) {
        let targets: Vec<Arc<Connection>> = {
            let by_user = self.by_user.read().await;
            let Some(ids) = by_user.get(user) else {
                return;
            };
            let connections = self.connections.read().await;
            ids.iter()
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };

        for conn in targets {
            if !conn.try_write(frame.to_string()) {
                debug!(conn_id = %conn.id, user, "publish dropped: write queue full");
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(id: &str) -> (Arc<Connection>, mpsc::Receiver<String>, watch::Receiver<bool>) {
        Connection::new(id, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let hub = ConnectionHub::new();
        let (a, _rx_a, _cl_a) = test_conn("c1");
        let (b, _rx_b, _cl_b) = test_conn("c1");
        hub.add(a).await.unwrap();
        assert!(matches!(hub.add(b).await, Err(HubError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_publish_reaches_all_user_connections() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a, _cl_a) = test_conn("c1");
        let (b, mut rx_b, _cl_b) = test_conn("c2");
        hub.add(a).await.unwrap();
        hub.add(b).await.unwrap();
        hub.reauthenticate("c1", "0xuser").await;
        hub.reauthenticate("c2", "0xuser").await;

        hub.publish("0xuser", "hello").await;
        assert_eq!(rx_a.recv().await.unwrap(), "hello");
        assert_eq!(rx_b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_reauthenticate_drops_old_binding() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a, _cl_a) = test_conn("c1");
        hub.add(a).await.unwrap();
        hub.reauthenticate("c1", "0xalice").await;
        hub.reauthenticate("c1", "0xbob").await;

        hub.publish("0xalice", "for alice").await;
        hub.publish("0xbob", "for bob").await;
        assert_eq!(rx_a.recv().await.unwrap(), "for bob");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stalled_write_trips_close_signal() {
        let (conn, _rx, mut close_rx) = test_conn("c1");
        // Nobody drains the queue; fill it past capacity.
        for i in 0..=WRITE_QUEUE_SIZE {
            conn.write(format!("frame {i}")).await;
        }
        assert!(*close_rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_empty_frames_dropped() {
        let (conn, mut rx, _cl) = test_conn("c1");
        conn.write(String::new()).await;
        conn.write("real".to_string()).await;
        assert_eq!(rx.recv().await.unwrap(), "real");
    }

    #[tokio::test]
    async fn test_remove_clears_user_index() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a, _cl_a) = test_conn("c1");
        hub.add(a).await.unwrap();
        hub.reauthenticate("c1", "0xuser").await;
        hub.remove("c1").await;

        hub.publish("0xuser", "gone").await;
        assert!(rx_a.try_recv().is_err());
        assert_eq!(hub.connection_count().await, 0);
    }
}
