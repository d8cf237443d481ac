//! WebSocket broadcast pools.
//!
//! A two-level structure: [`ConnectionPools`] maps a pool id (usually
//! `{contract}/{topic0}`) to a [`ConnectionPool`] of subscribers, each
//! tagged with a client-supplied query string. Broadcasts render once and
//! fan out per distinct query.

mod pool;
pub use pool::{ConnectionPool, Subscription};

use crate::types::Log;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

/// Kind of change a broadcast message announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsMessageType {
    /// A new record appeared.
    New,
    /// An existing record changed state.
    Update,
    /// A record was withdrawn.
    Remove,
}

/// A log broadcast to pool subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessageLog {
    /// Pool the message belongs to.
    pub pool_id: String,
    /// Change kind.
    #[serde(rename = "type")]
    pub message_type: WsMessageType,
    /// The log's content hash.
    pub id: String,
    /// Always `"log"`.
    pub data_type: String,
    /// The log itself, value-copied into the fan-out.
    pub data: Log,
}

/// Registry of topic-keyed connection pools.
#[derive(Debug, Default)]
pub struct ConnectionPools {
    pools: Mutex<HashMap<String, Arc<ConnectionPool>>>,
}

impl ConnectionPools {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a pool, creating it lazily and replacing a closed one.
    pub fn connect(
        &self,
        pool_id: &str,
        query: &str,
    ) -> (Subscription, mpsc::Receiver<String>) {
        let mut pools = self.pools.lock().expect("pool registry lock poisoned");

        let pool = match pools.get(pool_id) {
            Some(pool) if pool.is_open() => Arc::clone(pool),
            _ => {
                let pool = Arc::new(ConnectionPool::new(pool_id));
                pools.insert(pool_id.to_string(), Arc::clone(&pool));
                pool
            }
        };

        pool.subscribe(query)
    }

    /// Broadcasts a log to the pool derived from its contract and topic.
    ///
    /// The message renders to JSON once; each distinct subscriber query is
    /// evaluated against the log and matching queries receive the payload.
    pub fn broadcast_log(&self, message_type: WsMessageType, log: &Log) {
        let Some(pool_id) = log.pool_topic() else {
            return;
        };

        let message = WsMessageLog {
            pool_id: pool_id.clone(),
            message_type,
            id: log.hash.clone(),
            data_type: "log".to_string(),
            data: log.clone(),
        };
        let Ok(payload) = serde_json::to_string(&message) else {
            return;
        };

        let pool = {
            let pools = self.pools.lock().expect("pool registry lock poisoned");
            match pools.get(&pool_id) {
                Some(pool) if pool.is_open() => Arc::clone(pool),
                _ => return,
            }
        };

        for query in pool.queries() {
            if log.matches_query(&query) {
                pool.broadcast(&query, &payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogStatus;
    use alloy::primitives::U256;
    use chrono::Utc;
    use serde_json::json;

    fn log_with_data(data: serde_json::Value) -> Log {
        Log {
            hash: "0xhash".into(),
            tx_hash: "0xtx".into(),
            chain_id: "1".into(),
            topic: "0xddf252ad".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: String::new(),
            to: "0xContract".into(),
            value: U256::ZERO,
            data: Some(data),
            extra_data: None,
            status: LogStatus::Pending,
        }
    }

    #[tokio::test]
    async fn routes_by_query_filter() {
        let pools = ConnectionPools::new();
        let log = log_with_data(json!({"topic": "0xddf252ad", "from": "0x01"}));
        let pool_id = log.pool_topic().unwrap();

        let (_sub_all, mut rx_all) = pools.connect(&pool_id, "");
        let (_sub_match, mut rx_match) = pools.connect(&pool_id, "data.from=0x01");
        let (_sub_miss, mut rx_miss) = pools.connect(&pool_id, "data.from=0x02");

        pools.broadcast_log(WsMessageType::Update, &log);

        let received: WsMessageLog =
            serde_json::from_str(&rx_all.recv().await.unwrap()).unwrap();
        assert_eq!(received.id, "0xhash");
        assert_eq!(received.pool_id, pool_id);

        assert!(rx_match.try_recv().is_ok());
        assert!(rx_miss.try_recv().is_err());
    }

    #[tokio::test]
    async fn replaces_closed_pools() {
        let pools = ConnectionPools::new();
        let log = log_with_data(json!({"topic": "0xddf252ad"}));
        let pool_id = log.pool_topic().unwrap();

        let (sub, _rx) = pools.connect(&pool_id, "");
        drop(sub);

        // Pool closed with its last subscriber; a new connect gets a fresh
        // pool that still receives broadcasts.
        let (_sub2, mut rx2) = pools.connect(&pool_id, "");
        pools.broadcast_log(WsMessageType::New, &log);
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn skips_logs_without_topic() {
        let pools = ConnectionPools::new();
        let mut log = log_with_data(json!({"from": "0x01"}));
        log.data = Some(json!({"from": "0x01"}));
        // No topic in data means no pool id; broadcast is a no-op.
        pools.broadcast_log(WsMessageType::New, &log);
    }
}
