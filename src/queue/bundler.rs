//! The user-operation bundler.
//!
//! One [`Processor::process`] invocation takes a batch of queued user
//! operations, groups them by sponsor signer, packs each group into a
//! single `handleOps` transaction, signs it with the sponsor key and
//! submits it, reacting to node rejections with gas bumps, rejections or
//! retirement of the batch.
//!
//! Nonce sequencing relies on the queue's serial processor contract: at
//! most one `process` call is in flight, so `on-chain nonce +
//! len(in_progress[sponsor])` is race-free per sponsor.

use super::{Message, Processor, QueuePayload};
use crate::{
    constants::{MAX_GAS_BUMPS, TX_WAIT_TIMEOUT},
    error::RelayError,
    evm::{DynEvm, TxSubmitError},
    metrics::TransactionMetrics,
    nostr::NostrService,
    storage::RelayStorage,
    types::{parse_destination, EntryPoint, Log, LogStatus, UserOpMessage},
    ws::{ConnectionPools, WsMessageType},
};
use alloy::{
    consensus::{SignableTransaction, TxEnvelope},
    network::TxSignerSync,
    primitives::{Address, B256, U256},
    signers::local::PrivateKeySigner,
    sol_types::SolCall,
    transports::TransportErrorKind,
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::warn;

/// Bundles queued user operations into sponsor-signed transactions.
pub struct UserOpBundler {
    evm: DynEvm,
    storage: RelayStorage,
    nostr: NostrService,
    pools: Arc<ConnectionPools>,
    /// Tx hashes submitted but not yet observed mined, per sponsor. The
    /// count offsets the on-chain nonce for subsequent bundles.
    in_progress: Arc<Mutex<HashMap<Address, Vec<B256>>>>,
    metrics: TransactionMetrics,
}

impl std::fmt::Debug for UserOpBundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserOpBundler")
            .field("in_progress", &self.in_progress)
            .finish_non_exhaustive()
    }
}

fn transient(message: impl std::fmt::Display) -> RelayError {
    RelayError::TransientRpc(TransportErrorKind::custom_str(&message.to_string()))
}

fn all_with<F: Fn() -> RelayError>(
    msgs: Vec<Message>,
    make: F,
) -> Vec<(Message, RelayError)> {
    msgs.into_iter().map(|msg| (msg, make())).collect()
}

impl UserOpBundler {
    /// Creates a bundler.
    pub fn new(
        evm: DynEvm,
        storage: RelayStorage,
        nostr: NostrService,
        pools: Arc<ConnectionPools>,
    ) -> Self {
        Self {
            evm,
            storage,
            nostr,
            pools,
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            metrics: TransactionMetrics::default(),
        }
    }

    fn in_progress_count(&self, sponsor: Address) -> usize {
        self.in_progress
            .lock()
            .expect("in_progress lock poisoned")
            .get(&sponsor)
            .map_or(0, Vec::len)
    }

    fn track(&self, sponsor: Address, hash: B256) {
        self.in_progress
            .lock()
            .expect("in_progress lock poisoned")
            .entry(sponsor)
            .or_default()
            .push(hash);
    }

    fn untrack(&self, sponsor: Address, hash: B256) {
        untrack_in(&self.in_progress, sponsor, hash);
    }

    /// Builds the speculative logs for ops whose payload matches a
    /// registered event shape, persisting any pending description.
    async fn speculative_logs(
        &self,
        chain_id: u64,
        tx_hash: B256,
        txms: &[&UserOpMessage],
    ) -> Result<Vec<Log>, RelayError> {
        let events = self.storage.list_events(&chain_id.to_string()).await?;

        let mut logs = Vec::new();
        for txm in txms {
            let Some(serde_json::Value::Object(data)) = &txm.data else {
                // Without a payload there is no stable hash to track.
                continue;
            };

            if !events.iter().any(|ev| ev.is_valid_data(data)) {
                continue;
            }

            let Some(dest) = parse_destination(&txm.userop.callData) else {
                continue;
            };

            let now = Utc::now();
            let mut log = Log {
                hash: String::new(),
                tx_hash: tx_hash.to_string(),
                chain_id: chain_id.to_string(),
                topic: data.get("topic").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                created_at: now,
                updated_at: now,
                nonce: txm.userop.nonce.saturating_to::<u64>() as i64,
                sender: txm.userop.sender.to_string(),
                to: dest.to_string(),
                value: U256::ZERO,
                data: txm.data.clone(),
                extra_data: None,
                status: LogStatus::Sending,
            };
            log.hash = log.generate_unique_hash();

            if let Some(extra) = &txm.extra_data {
                if let Err(err) = self.storage.upsert_pending_data(&log.hash, extra).await {
                    warn!(%err, hash = %log.hash, "failed to store pending description");
                }
            }

            self.pools.broadcast_log(WsMessageType::New, &log);
            logs.push(log);
        }

        Ok(logs)
    }

    fn broadcast_status(&self, logs: &mut [Log], status: LogStatus, ty: WsMessageType) {
        for log in logs {
            log.status = status;
            log.updated_at = Utc::now();
            self.pools.broadcast_log(ty, log);
        }
    }

    /// Handles one sponsor group. Returns the messages that failed, paired
    /// with their errors; successes are responded to inline.
    async fn process_group(
        &self,
        sponsor: Address,
        signer: PrivateKeySigner,
        mut msgs: Vec<Message>,
    ) -> Vec<(Message, RelayError)> {
        let txms: Vec<UserOpMessage> = msgs
            .iter()
            .filter_map(|msg| match &msg.payload {
                QueuePayload::UserOp(txm) => Some(txm.clone()),
                QueuePayload::Push(_) => None,
            })
            .collect();

        let Some(sample) = txms.first() else {
            return vec![];
        };
        let (entry_point, chain_id, bump_gas) =
            (sample.entry_point, sample.chain_id, sample.bump_gas);

        // Nonce: on-chain count plus whatever we already have in flight.
        let nonce = match self.evm.nonce_at(sponsor).await {
            Ok(nonce) => nonce + self.in_progress_count(sponsor) as u64,
            Err(err) => {
                let message = err.to_string();
                return all_with(msgs, move || transient(&message));
            }
        };

        let calldata = EntryPoint::handleOpsCall {
            ops: txms.iter().map(|txm| txm.userop.clone()).collect(),
            beneficiary: entry_point,
        }
        .abi_encode();

        let mut tx = match self
            .evm
            .new_tx(nonce, sponsor, entry_point, calldata.into(), bump_gas)
            .await
        {
            Ok(tx) => tx,
            Err(err) => {
                let message = err.to_string();
                return all_with(msgs, move || transient(&message));
            }
        };

        let signature = match signer.sign_transaction_sync(&mut tx) {
            Ok(signature) => signature,
            Err(err) => {
                let message = err.to_string();
                return all_with(msgs, move || RelayError::Validation(message.clone()));
            }
        };
        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));
        let tx_hash = *envelope.tx_hash();

        self.track(sponsor, tx_hash);

        let mut logs = match self.speculative_logs(chain_id, tx_hash, &txms.iter().collect::<Vec<_>>()).await
        {
            Ok(logs) => logs,
            Err(err) => {
                self.untrack(sponsor, tx_hash);
                let message = err.to_string();
                return all_with(msgs, move || RelayError::Validation(message.clone()));
            }
        };

        // Record the submission as a signed event; losing it does not fail
        // the bundle.
        for txm in &txms {
            match self.nostr.user_op_event(txm) {
                Ok(builder) => {
                    if let Err(err) = self.nostr.sign_and_save(builder).await {
                        warn!(%err, "failed to save user op event");
                    }
                }
                Err(err) => warn!(%err, "failed to build user op event"),
            }
        }

        match self.evm.send_transaction(&envelope).await {
            Ok(()) => self.metrics.sent.increment(1),
            Err(TxSubmitError::ReplacementRequested) => {
                self.metrics.failed.increment(1);
                self.untrack(sponsor, tx_hash);
                return msgs
                    .into_iter()
                    .map(|mut msg| {
                        if let QueuePayload::UserOp(txm) = &mut msg.payload {
                            txm.bump_gas += 1;
                            if txm.bump_gas > MAX_GAS_BUMPS {
                                return (msg, RelayError::ReplacementExhausted(MAX_GAS_BUMPS));
                            }
                        }
                        (msg, RelayError::ReplacementRequested)
                    })
                    .collect();
            }
            Err(TxSubmitError::InsufficientFunds(message)) => {
                self.metrics.failed.increment(1);
                self.untrack(sponsor, tx_hash);
                self.broadcast_status(&mut logs, LogStatus::Fail, WsMessageType::Update);
                return all_with(msgs, move || {
                    RelayError::Validation(format!("insufficient funds: {message}"))
                });
            }
            Err(TxSubmitError::Rpc { code, message }) => {
                self.metrics.failed.increment(1);
                self.untrack(sponsor, tx_hash);
                return all_with(msgs, move || {
                    RelayError::Validation(format!("rpc error {code}: {message}"))
                });
            }
            Err(TxSubmitError::Transient(err)) => {
                self.metrics.failed.increment(1);
                self.untrack(sponsor, tx_hash);
                let message = err.to_string();
                return all_with(msgs, move || transient(&message));
            }
        }

        // Submitted: the callers get their tx hash now, mining is watched
        // in the background.
        for msg in &mut msgs {
            msg.respond(Ok(serde_json::json!(tx_hash.to_string())));
        }
        self.broadcast_status(&mut logs, LogStatus::Pending, WsMessageType::Update);

        let evm = Arc::clone(&self.evm);
        let pools = Arc::clone(&self.pools);
        let in_progress = Arc::clone(&self.in_progress);
        tokio::spawn(async move {
            if let Err(err) = evm.wait_for_tx(tx_hash, TX_WAIT_TIMEOUT).await {
                warn!(%err, tx = %tx_hash, "bundle was not mined, withdrawing speculative logs");
                for mut log in logs {
                    log.status = LogStatus::Fail;
                    log.updated_at = Utc::now();
                    pools.broadcast_log(WsMessageType::Remove, &log);
                }
            }
            untrack_in(&in_progress, sponsor, tx_hash);
        });

        vec![]
    }
}

fn untrack_in(
    in_progress: &Mutex<HashMap<Address, Vec<B256>>>,
    sponsor: Address,
    hash: B256,
) {
    let mut map = in_progress.lock().expect("in_progress lock poisoned");
    if let Some(hashes) = map.get_mut(&sponsor) {
        hashes.retain(|h| *h != hash);
    }
}

#[async_trait]
impl Processor for UserOpBundler {
    async fn process(&self, messages: Vec<Message>) -> Vec<(Message, RelayError)> {
        let mut failed = Vec::new();
        let mut groups: HashMap<Address, (PrivateKeySigner, Vec<Message>)> = HashMap::new();

        for message in messages {
            let txm = match &message.payload {
                QueuePayload::UserOp(txm) => txm,
                QueuePayload::Push(_) => {
                    failed.push((message, RelayError::validation("invalid tx message")));
                    continue;
                }
            };

            // The sponsor signer is recovered from the stored key; ops
            // sharing a key share a nonce sequence and must be grouped.
            let sponsor = match self.storage.get_sponsor(&txm.paymaster.to_string()).await {
                Ok(sponsor) => sponsor,
                Err(err) => {
                    failed.push((message, err.into()));
                    continue;
                }
            };

            let signer: PrivateKeySigner = match sponsor.private_key.parse() {
                Ok(signer) => signer,
                Err(_) => {
                    failed.push((message, RelayError::validation("invalid sponsor key")));
                    continue;
                }
            };

            groups
                .entry(signer.address())
                .or_insert_with(|| (signer, Vec::new()))
                .1
                .push(message);
        }

        for (sponsor, (signer, msgs)) in groups {
            failed.extend(self.process_group(sponsor, signer, msgs).await);
        }

        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evm::mock::{MockEvm, SubmitBehavior},
        types::{Event, SmartAccount, Sponsor, UserOperation},
        ws::WsMessageLog,
    };
    use alloy::{
        primitives::{address, Bytes},
        sol_types::SolCall,
    };
    use nostr::Keys;

    const SPONSOR_KEY: &str =
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    const PAYMASTER: Address = address!("1111111111111111111111111111111111111111");

    async fn setup(chain_nonce: u64) -> (Arc<MockEvm>, UserOpBundler, RelayStorage) {
        let storage = RelayStorage::in_memory("secret");
        storage
            .add_sponsor(&Sponsor {
                contract: PAYMASTER.to_string(),
                private_key: SPONSOR_KEY.to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let evm = Arc::new(MockEvm::new(chain_nonce));
        let dyn_evm: DynEvm = evm.clone();
        let nostr =
            NostrService::new(Keys::generate(), storage.clone(), "wss://relay.example.com");
        let bundler =
            UserOpBundler::new(dyn_evm, storage.clone(), nostr, Arc::new(ConnectionPools::new()));

        (evm, bundler, storage)
    }

    fn userop_message(tag: u8) -> Message {
        let txm = UserOpMessage {
            paymaster: PAYMASTER,
            entry_point: address!("2222222222222222222222222222222222222222"),
            chain_id: 1,
            userop: UserOperation {
                signature: Bytes::from(vec![tag]),
                ..Default::default()
            },
            data: None,
            extra_data: None,
            bump_gas: 0,
        };
        Message::new(txm.identity(), QueuePayload::UserOp(txm))
    }

    #[tokio::test]
    async fn sequences_nonces_across_batches() {
        let (evm, bundler, _storage) = setup(5).await;

        // Three sequential batches before any receipt is observed: the
        // in-flight count offsets the unchanged on-chain nonce.
        for tag in 0..3u8 {
            let failed = bundler.process(vec![userop_message(tag)]).await;
            assert!(failed.is_empty());
        }

        assert_eq!(*evm.submitted_nonces.lock().unwrap(), vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn responds_with_tx_hash() {
        let (_evm, bundler, _storage) = setup(0).await;

        let (message, handle) = Message::for_userop(UserOpMessage {
            paymaster: PAYMASTER,
            entry_point: address!("2222222222222222222222222222222222222222"),
            chain_id: 1,
            userop: UserOperation::default(),
            data: None,
            extra_data: None,
            bump_gas: 0,
        });

        let failed = bundler.process(vec![message]).await;
        assert!(failed.is_empty());

        let hash = handle.wait().await.unwrap();
        assert!(hash.as_str().unwrap().starts_with("0x"));
    }

    #[tokio::test]
    async fn bumps_gas_on_replacement_request() {
        let (evm, bundler, _storage) = setup(5).await;
        *evm.behavior.lock().unwrap() = SubmitBehavior::RequestReplacement;

        let failed = bundler.process(vec![userop_message(0)]).await;
        assert_eq!(failed.len(), 1);

        let (message, err) = &failed[0];
        assert!(matches!(err, RelayError::ReplacementRequested));
        let QueuePayload::UserOp(txm) = &message.payload else {
            panic!("payload changed kind");
        };
        assert_eq!(txm.bump_gas, 1);

        // The failed submission no longer occupies a nonce slot.
        *evm.behavior.lock().unwrap() = SubmitBehavior::Accept;
        let failed = bundler.process(vec![userop_message(1)]).await;
        assert!(failed.is_empty());
        assert_eq!(*evm.submitted_nonces.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn generic_node_errors_stay_retryable() {
        let (evm, bundler, _storage) = setup(5).await;
        *evm.behavior.lock().unwrap() = SubmitBehavior::GenericNodeError;

        let failed = bundler.process(vec![userop_message(0)]).await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].1, RelayError::TransientRpc(_)));
        assert!(failed[0].1.is_retryable(), "the queue must re-enqueue -32000 failures");

        // The failed submission freed its nonce slot.
        *evm.behavior.lock().unwrap() = SubmitBehavior::Accept;
        let failed = bundler.process(vec![userop_message(1)]).await;
        assert!(failed.is_empty());
        assert_eq!(*evm.submitted_nonces.lock().unwrap(), vec![5]);
    }

    #[tokio::test]
    async fn exhausts_replacement_after_cap() {
        let (evm, bundler, _storage) = setup(5).await;
        *evm.behavior.lock().unwrap() = SubmitBehavior::RequestReplacement;

        let mut message = userop_message(0);
        if let QueuePayload::UserOp(txm) = &mut message.payload {
            txm.bump_gas = MAX_GAS_BUMPS;
        }

        let failed = bundler.process(vec![message]).await;
        assert!(matches!(failed[0].1, RelayError::ReplacementExhausted(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_sponsor() {
        let (_evm, bundler, _storage) = setup(0).await;

        let mut message = userop_message(0);
        if let QueuePayload::UserOp(txm) = &mut message.payload {
            txm.paymaster = address!("9999999999999999999999999999999999999999");
        }

        let failed = bundler.process(vec![message]).await;
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].1, RelayError::Store(_)));
    }

    #[tokio::test]
    async fn rejects_foreign_payloads() {
        let (_evm, bundler, _storage) = setup(0).await;

        let message = Message::new("push:1", QueuePayload::Push(serde_json::json!({})));
        let failed = bundler.process(vec![message]).await;
        assert!(matches!(failed[0].1, RelayError::Validation(_)));
    }

    #[tokio::test]
    async fn tracks_speculative_logs_for_registered_shapes() {
        let (_evm, bundler, storage) = setup(0).await;

        storage
            .register_event(&Event {
                chain_id: "1".into(),
                contract: "0xcontract".into(),
                topic: "0xddf252ad".into(),
                alias: "transfers".into(),
                event_signature: "Transfer(address from, address to, uint256 value)".into(),
                name: "Transfer".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let dest = address!("3333333333333333333333333333333333333333");
        let call_data = SmartAccount::executeCall {
            dest,
            value: U256::ZERO,
            func: Bytes::new(),
        }
        .abi_encode();

        let mut message = userop_message(0);
        if let QueuePayload::UserOp(txm) = &mut message.payload {
            txm.userop.callData = call_data.into();
            txm.data = Some(serde_json::json!({
                "topic": "0xddf252ad",
                "from": "0xaa",
                "to": "0xbb",
                "value": "10",
            }));
            txm.extra_data = Some(serde_json::json!({"description": "lunch"}));
        }

        // Subscribe to the pool the speculative log lands in.
        let pool_id = format!("{}/0xddf252ad", dest).to_lowercase();
        let (_sub, mut rx) = bundler.pools.connect(&pool_id, "");

        let failed = bundler.process(vec![message]).await;
        assert!(failed.is_empty());

        let new_msg: WsMessageLog = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(new_msg.data.status, LogStatus::Sending);

        let update_msg: WsMessageLog = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(update_msg.data.status, LogStatus::Pending);
        assert_eq!(update_msg.id, new_msg.id);

        // The description waits for the indexer under the log hash.
        let pending = storage.get_pending_data(&new_msg.id).await.unwrap();
        assert_eq!(pending.unwrap()["description"], "lunch");
    }
}
