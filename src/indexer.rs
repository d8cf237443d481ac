//! Chain indexer.
//!
//! One worker per registered event: subscribe to the filtered log stream,
//! decode each log against the registered signature, materialize it as a
//! signed log event and fan it out to WebSocket subscribers. Subscription
//! drops are retried forever; event-store failures are fatal and surface
//! on the indexer's quit channel.

use crate::{
    constants::BLOCK_CACHE_TTL_SECS,
    error::RelayError,
    evm::DynEvm,
    metrics::IndexerMetrics,
    nostr::NostrService,
    storage::RelayStorage,
    types::{parse_topics_from_hashes, Event, ExtraData, Log, LogStatus},
    ws::{ConnectionPools, WsMessageType},
};
use alloy::{
    primitives::{Address, U256},
    rpc::types::Filter,
};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Indexes registered events into the signed-event store.
pub struct Indexer {
    evm: DynEvm,
    storage: RelayStorage,
    nostr: NostrService,
    pools: Arc<ConnectionPools>,
    cancel: CancellationToken,
    metrics: IndexerMetrics,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer").finish_non_exhaustive()
    }
}

impl Indexer {
    /// Creates an indexer.
    pub fn new(
        evm: DynEvm,
        storage: RelayStorage,
        nostr: NostrService,
        pools: Arc<ConnectionPools>,
        cancel: CancellationToken,
    ) -> Self {
        Self { evm, storage, nostr, pools, cancel, metrics: IndexerMetrics::default() }
    }

    /// Spawns one worker per registered event and blocks until a worker
    /// dies with a fatal error or everything is cancelled.
    pub async fn start(self: Arc<Self>) -> Result<(), RelayError> {
        let events = self.storage.list_events(&self.evm.chain_id().to_string()).await?;

        let (quit_tx, mut quit_rx) = mpsc::channel::<RelayError>(1);

        for event in events {
            let indexer = Arc::clone(&self);
            let quit = quit_tx.clone();
            tokio::spawn(async move {
                info!(contract = %event.contract, alias = %event.alias, "indexing event");
                if let Err(err) = indexer.listen_to_logs(&event).await {
                    let _ = quit.send(err).await;
                }
            });
        }
        drop(quit_tx);

        // A `None` here means every worker ended quietly (cancellation or
        // nothing registered).
        match quit_rx.recv().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Builds the log filter for a registered event: its contract, its
    /// topic0, starting just past the current head.
    async fn filter_for_event(&self, event: &Event) -> Result<Filter, RelayError> {
        let contract: Address = event
            .contract
            .parse()
            .map_err(|_| RelayError::Validation(format!("invalid contract: {}", event.contract)))?;

        let from_block = self.evm.latest_block().await? + 1;

        Ok(Filter::new()
            .address(contract)
            .event_signature(event.topic0())
            .from_block(from_block))
    }

    async fn listen_to_logs(&self, event: &Event) -> Result<(), RelayError> {
        let filter = self.filter_for_event(event).await?;

        let (log_tx, mut log_rx) = mpsc::channel(256);
        {
            let evm = Arc::clone(&self.evm);
            let cancel = self.cancel.clone();
            tokio::spawn(async move { evm.listen_for_logs(cancel, filter, log_tx).await });
        }

        // Small block -> timestamp cache; entries are evicted once newer
        // blocks put them 60 s in the past.
        let mut block_times: HashMap<u64, u64> = HashMap::new();
        let mut evictions: Vec<(u64, u64)> = Vec::new();

        while let Some(log) = log_rx.recv().await {
            let Some(block_number) = log.block_number else {
                continue;
            };

            let timestamp = match block_times.get(&block_number) {
                Some(timestamp) => *timestamp,
                None => {
                    let timestamp = self.evm.block_time(block_number).await?;
                    block_times.insert(block_number, timestamp);

                    evictions.retain(|(deadline, block)| {
                        if *deadline < timestamp {
                            block_times.remove(block);
                            false
                        } else {
                            true
                        }
                    });
                    evictions.push((timestamp + BLOCK_CACHE_TTL_SECS, block_number));

                    timestamp
                }
            };

            self.index_log(event, &log, timestamp).await?;
        }

        Ok(())
    }

    /// Decodes one raw log and publishes it. Malformed events are logged
    /// and skipped so one bad registration cannot kill the worker.
    async fn index_log(
        &self,
        event: &Event,
        raw: &alloy::rpc::types::Log,
        block_timestamp: u64,
    ) -> Result<(), RelayError> {
        let topics = match parse_topics_from_hashes(event, raw.topics(), &raw.data().data) {
            Ok(topics) => topics,
            Err(err) => {
                warn!(contract = %event.contract, %err, "failed to parse topics from log");
                self.metrics.decode_failures.increment(1);
                return Ok(());
            }
        };

        let created_at = DateTime::<Utc>::from_timestamp(block_timestamp as i64, 0)
            .unwrap_or_else(Utc::now);

        // Value and nonce are not recoverable from the log alone.
        let mut log = Log {
            hash: String::new(),
            tx_hash: raw.transaction_hash.unwrap_or_default().to_string(),
            chain_id: self.evm.chain_id().to_string(),
            topic: event.topic.clone(),
            created_at,
            updated_at: Utc::now(),
            nonce: 0,
            sender: String::new(),
            to: raw.address().to_string(),
            value: U256::ZERO,
            data: Some(topics.to_json()),
            extra_data: None,
            status: LogStatus::Success,
        };
        log.hash = log.generate_unique_hash();

        let log_event = self.nostr.sign_and_save(self.nostr.tx_log_event(&log, None)?).await?;

        // A description may have been parked by the bundler while the op
        // was in flight; surface it as a quote repost and clear it.
        if let Some(pending) = self.storage.get_pending_data(&log.hash).await? {
            if let Ok(extra) = serde_json::from_value::<ExtraData>(pending) {
                if !extra.description.is_empty() {
                    let repost = self.nostr.quote_repost_event(
                        &extra.description,
                        &event.alias,
                        &log_event,
                    )?;
                    self.nostr.sign_and_save(repost).await?;
                }
            }
            self.storage.delete_pending_data(&log.hash).await?;
        }

        self.pools.broadcast_log(WsMessageType::Update, &log);
        self.metrics.logs_indexed.increment(1);

        Ok(())
    }
}
