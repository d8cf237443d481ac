//! A single topic-keyed connection pool.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

/// Buffered messages per connection before a slow consumer starts losing
/// broadcasts.
const CONNECTION_BUFFER: usize = 64;

#[derive(Debug)]
struct Connection {
    query: String,
    tx: mpsc::Sender<String>,
}

/// A set of WebSocket subscribers interested in one pool id, each tagged
/// with its query filter.
#[derive(Debug)]
pub struct ConnectionPool {
    id: String,
    open: AtomicBool,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Connection>>,
}

impl ConnectionPool {
    /// Creates an open pool for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            open: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// The pool id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the pool still accepts broadcasts. A pool closes for good
    /// when its last subscriber leaves; the registry then replaces it.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Registers a subscriber with its query filter, returning the stream
    /// of rendered messages and a guard that deregisters on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        query: impl Into<String>,
    ) -> (Subscription, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.conns
            .lock()
            .expect("pool lock poisoned")
            .insert(id, Connection { query: query.into(), tx });

        (Subscription { pool: Arc::clone(self), id }, rx)
    }

    fn disconnect(&self, id: u64) {
        let mut conns = self.conns.lock().expect("pool lock poisoned");
        conns.remove(&id);
        if conns.is_empty() {
            self.open.store(false, Ordering::Release);
        }
    }

    /// The distinct query strings present on current subscribers.
    pub fn queries(&self) -> Vec<String> {
        let conns = self.conns.lock().expect("pool lock poisoned");
        let mut queries: Vec<String> = conns.values().map(|c| c.query.clone()).collect();
        queries.sort();
        queries.dedup();
        queries
    }

    /// Fans a rendered message out to every subscriber holding `query`.
    /// Slow consumers with a full buffer lose the message.
    pub fn broadcast(&self, query: &str, payload: &str) {
        let conns = self.conns.lock().expect("pool lock poisoned");
        for conn in conns.values() {
            if conn.query == query {
                let _ = conn.tx.try_send(payload.to_string());
            }
        }
    }
}

/// Keeps a pool registration alive; dropping it removes the connection and
/// closes the pool when it was the last one.
#[derive(Debug)]
pub struct Subscription {
    pool: Arc<ConnectionPool>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pool.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closes_when_last_subscriber_leaves() {
        let pool = Arc::new(ConnectionPool::new("a/b"));
        let (sub1, _rx1) = pool.subscribe("");
        let (sub2, _rx2) = pool.subscribe("data.from=0x01");

        assert!(pool.is_open());
        drop(sub1);
        assert!(pool.is_open());
        drop(sub2);
        assert!(!pool.is_open());
    }

    #[test]
    fn deduplicates_queries() {
        let pool = Arc::new(ConnectionPool::new("a/b"));
        let (_s1, _r1) = pool.subscribe("data.from=0x01");
        let (_s2, _r2) = pool.subscribe("data.from=0x01");
        let (_s3, _r3) = pool.subscribe("");

        assert_eq!(pool.queries(), vec!["".to_string(), "data.from=0x01".to_string()]);
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_query_only() {
        let pool = Arc::new(ConnectionPool::new("a/b"));
        let (_s1, mut r1) = pool.subscribe("data.from=0x01");
        let (_s2, mut r2) = pool.subscribe("");

        pool.broadcast("data.from=0x01", "payload");

        assert_eq!(r1.recv().await.unwrap(), "payload");
        assert!(r2.try_recv().is_err());
    }
}
