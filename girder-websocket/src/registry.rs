//! Registry of live connections.

use crate::connection::{ConnectionHandle, ConnectionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Live connections of a server plus the accepting flag.
///
/// A connection stays registered until its [`Registration`] is dropped,
/// which happens once its handler and both connection tasks are done.
#[derive(Clone)]
pub(crate) struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    accepting: Mutex<bool>,
    live: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                accepting: Mutex::new(true),
                live: watch::channel(0).0,
            }),
        }
    }

    /// Register a connection.
    ///
    /// Returns `None` once the registry stopped accepting.
    pub fn register(&self, handle: ConnectionHandle) -> Option<Registration> {
        let accepting = self.inner.accepting.lock();
        if !*accepting {
            return None;
        }
        let id = handle.id().to_string();
        self.inner.connections.insert(id.clone(), handle);
        self.inner.live.send_modify(|live| *live += 1);
        drop(accepting);

        Some(Registration {
            registry: self.clone(),
            id,
        })
    }

    /// Refuse every later registration.
    pub fn stop_accepting(&self) {
        *self.inner.accepting.lock() = false;
    }

    pub fn is_accepting(&self) -> bool {
        *self.inner.accepting.lock()
    }

    pub fn len(&self) -> usize {
        *self.inner.live.borrow()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.inner
            .connections
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Wait until no connection is registered.
    pub async fn drained(&self) {
        let mut live = self.inner.live.subscribe();
        let _ = live.wait_for(|live| *live == 0).await;
    }

    fn unregister(&self, id: &str) {
        if self.inner.connections.remove(id).is_some() {
            self.inner.live.send_modify(|live| *live -= 1);
        }
    }
}

/// Keeps a connection registered; unregisters on drop.
pub(crate) struct Registration {
    registry: ConnectionRegistry,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
        tracing::trace!(connection_id = %self.id, "Connection unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionParts};
    use crate::options::Options;
    use std::time::Duration;

    fn connection(id: &str) -> (Connection, tokio::io::DuplexStream) {
        let mut options = Options::default();
        options.set_defaults();
        let (server, client) = tokio::io::duplex(1024);
        let connection = Connection::open(
            server,
            ConnectionParts {
                id: id.to_string(),
                request: http::Request::new(()),
                subprotocol: None,
                remote_addr: None,
                options: Arc::new(options),
                deflate: None,
            },
        );
        (connection, client)
    }

    #[tokio::test]
    async fn test_register_and_drop() {
        let registry = ConnectionRegistry::new();
        let (first, _a) = connection("a");
        let (second, _b) = connection("b");

        let first_reg = registry.register(first.handle()).unwrap();
        let second_reg = registry.register(second.handle()).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        drop(first_reg);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_none());

        let drained = tokio::spawn({
            let registry = registry.clone();
            async move { registry.drained().await }
        });
        drop(second_reg);
        tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_stop_accepting_refuses_registration() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_accepting());

        registry.stop_accepting();
        let (conn, _client) = connection("late");
        assert!(registry.register(conn.handle()).is_none());
        assert_eq!(registry.len(), 0);

        // Nothing registered, nothing to wait for.
        registry.drained().await;
    }
}
