//! Chain-facing facade over a JSON-RPC endpoint.
//!
//! Everything the relay needs from the chain goes through [`EvmRequester`]:
//! deployment checks, nonces, fee quotes, transaction construction and
//! submission, receipt waiting and filtered log streams. The bundler and
//! indexer are written against the trait so tests can swap in a mock.

use crate::{
    constants::{
        DEFAULT_MIN_PRIORITY_FEE, LOW_COST_BASE_FEE_THRESHOLD, LOW_COST_MIN_PRIORITY_FEE,
        MIN_GAS_BUFFER, SUBSCRIBE_RETRY_DELAY,
    },
    error::RelayError,
};
use alloy::{
    consensus::{TxEip1559, TxEnvelope},
    eips::{BlockNumberOrTag, Encodable2718},
    primitives::{Address, Bytes, TxKind, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log, TransactionRequest},
    transports::{RpcError, TransportErrorKind, TransportResult},
};
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

/// A stream of filtered logs.
pub type LogStream = Pin<Box<dyn Stream<Item = Log> + Send>>;

/// Shared handle to an [`EvmRequester`].
pub type DynEvm = Arc<dyn EvmRequester>;

/// Errors that may occur while submitting a signed transaction.
#[derive(Debug, thiserror::Error)]
pub enum TxSubmitError {
    /// The node asked for the transaction to be replaced (code -32010).
    #[error("transaction replacement requested")]
    ReplacementRequested,
    /// The signer cannot cover gas for the transaction.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    /// The node rejected the transaction with some other RPC error code.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code returned by the node.
        code: i64,
        /// Error message returned by the node.
        message: String,
    },
    /// A transport-level failure; worth retrying.
    #[error(transparent)]
    Transient(#[from] RpcError<TransportErrorKind>),
}

/// Errors that may occur while waiting for a transaction receipt.
#[derive(Debug, thiserror::Error)]
pub enum TxWaitError {
    /// The transaction was not mined within the timeout.
    #[error("transaction was not mined in time")]
    Timeout,
    /// The transaction was mined but its receipt reports failure.
    #[error("transaction was mined but reverted")]
    MinedFailure,
    /// RPC failure while polling for the receipt.
    #[error(transparent)]
    Rpc(#[from] RpcError<TransportErrorKind>),
}

/// The chain operations the relay depends on.
#[async_trait]
pub trait EvmRequester: std::fmt::Debug + Send + Sync {
    /// The chain id the client is connected to.
    fn chain_id(&self) -> u64;

    /// Returns the code deployed at `address`, empty when there is none.
    async fn code_at(&self, address: Address) -> TransportResult<Bytes>;

    /// Returns the number of transactions sent from `address`.
    async fn nonce_at(&self, address: Address) -> TransportResult<u64>;

    /// The base fee of the latest block, in wei.
    async fn base_fee(&self) -> TransportResult<u128>;

    /// The node's suggested priority fee, in wei.
    async fn max_priority_fee_per_gas(&self) -> TransportResult<u128>;

    /// Estimates gas for a call from `from` to `to` with `data`.
    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes)
        -> TransportResult<u64>;

    /// Performs a read-only contract call.
    async fn call(&self, to: Address, data: Bytes) -> TransportResult<Bytes>;

    /// Constructs a dynamic-fee transaction priced for current network
    /// conditions. `extra_gas_tier >= 1` multiplies both fee caps by
    /// `1 + tier`, used for replacement bumps.
    async fn new_tx(
        &self,
        nonce: u64,
        from: Address,
        to: Address,
        data: Bytes,
        extra_gas_tier: u8,
    ) -> Result<TxEip1559, RelayError>;

    /// Broadcasts a signed transaction, classifying node rejections.
    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), TxSubmitError>;

    /// Blocks until the transaction is mined or `timeout` elapses. Fails
    /// with [`TxWaitError::MinedFailure`] when the receipt reports failure.
    async fn wait_for_tx(&self, hash: B256, timeout: Duration) -> Result<(), TxWaitError>;

    /// Streams logs matching `filter` into `sink`, resubscribing with
    /// backoff on transport errors. Returns only on cancellation or when
    /// the sink is dropped.
    async fn listen_for_logs(
        &self,
        cancel: CancellationToken,
        filter: Filter,
        sink: mpsc::Sender<Log>,
    );

    /// The latest block number.
    async fn latest_block(&self) -> TransportResult<u64>;

    /// The timestamp of the given block.
    async fn block_time(&self, number: u64) -> TransportResult<u64>;

    /// Forwards a raw JSON-RPC request to the upstream node.
    async fn raw_request(
        &self,
        method: String,
        params: Vec<serde_json::Value>,
    ) -> TransportResult<serde_json::Value>;
}

/// [`EvmRequester`] over an alloy provider.
#[derive(Debug, Clone)]
pub struct EvmClient {
    provider: DynProvider,
    chain_id: u64,
    polling: bool,
}

impl EvmClient {
    /// Connects to the chain, over WebSocket unless `polling` asks for the
    /// HTTP endpoint with poll-based log watching.
    pub async fn connect(rpc_url: &Url, ws_url: &Url, polling: bool) -> eyre::Result<Self> {
        let provider: DynProvider = if polling {
            ProviderBuilder::new().connect_http(rpc_url.clone()).erased()
        } else {
            ProviderBuilder::new()
                .connect_ws(WsConnect::new(ws_url.as_str()))
                .await?
                .erased()
        };

        let chain_id = provider.get_chain_id().await?;

        Ok(Self { provider, chain_id, polling })
    }

    async fn log_stream(&self, filter: &Filter) -> TransportResult<LogStream> {
        if self.polling {
            let poller = self.provider.watch_logs(filter).await?;
            Ok(poller.into_stream().flat_map(stream::iter).boxed())
        } else {
            Ok(self.provider.subscribe_logs(filter).await?.into_stream().boxed())
        }
    }
}

#[async_trait]
impl EvmRequester for EvmClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn code_at(&self, address: Address) -> TransportResult<Bytes> {
        self.provider.get_code_at(address).await
    }

    async fn nonce_at(&self, address: Address) -> TransportResult<u64> {
        self.provider.get_transaction_count(address).await
    }

    async fn base_fee(&self) -> TransportResult<u128> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| TransportErrorKind::custom_str("latest block not found"))?;
        Ok(block.header.base_fee_per_gas.unwrap_or_default() as u128)
    }

    async fn max_priority_fee_per_gas(&self) -> TransportResult<u128> {
        self.provider.get_max_priority_fee_per_gas().await
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> TransportResult<u64> {
        let request = TransactionRequest::default().from(from).to(to).input(data.into());
        self.provider.estimate_gas(request).await
    }

    async fn call(&self, to: Address, data: Bytes) -> TransportResult<Bytes> {
        let request = TransactionRequest::default().to(to).input(data.into());
        self.provider.call(request).await
    }

    async fn new_tx(
        &self,
        nonce: u64,
        from: Address,
        to: Address,
        data: Bytes,
        extra_gas_tier: u8,
    ) -> Result<TxEip1559, RelayError> {
        let base_fee = self.base_fee().await?;
        let tip = self.max_priority_fee_per_gas().await?;

        // Chains with sub-0.01 Gwei base fees (rollups) get minimal pricing;
        // everything else gets conservative multipliers.
        let low_cost = base_fee < LOW_COST_BASE_FEE_THRESHOLD;
        let (min_priority_fee, base_fee_multiplier) = if low_cost {
            (LOW_COST_MIN_PRIORITY_FEE, 1)
        } else {
            (DEFAULT_MIN_PRIORITY_FEE, 2)
        };

        let tip = tip.max(min_priority_fee);
        let max_priority_fee = if low_cost { tip } else { tip + tip / 10 };
        let max_fee = max_priority_fee + base_fee * base_fee_multiplier;

        let gas_limit = self.estimate_gas(from, to, data.clone()).await?;
        let gas_buffer = if low_cost {
            (gas_limit / 2).max(MIN_GAS_BUFFER).max(gas_limit / 20)
        } else {
            gas_limit / 2
        };

        let (mut fee_cap, mut tip_cap) = (max_fee + max_fee / 10, max_priority_fee + max_priority_fee / 10);
        if extra_gas_tier > 0 {
            let tier = extra_gas_tier as u128;
            fee_cap = max_fee + max_fee * tier;
            tip_cap = max_priority_fee + max_priority_fee * tier;
        }

        Ok(TxEip1559 {
            chain_id: self.chain_id,
            nonce,
            gas_limit: gas_limit + gas_buffer,
            max_fee_per_gas: fee_cap,
            max_priority_fee_per_gas: tip_cap,
            to: TxKind::Call(to),
            value: U256::ZERO,
            input: data,
            access_list: Default::default(),
        })
    }

    async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), TxSubmitError> {
        match self.provider.send_raw_transaction(&tx.encoded_2718()).await {
            Ok(_) => Ok(()),
            Err(err) => Err(classify_submit_error(err)),
        }
    }

    async fn wait_for_tx(&self, hash: B256, timeout: Duration) -> Result<(), TxWaitError> {
        let receipt = tokio::time::timeout(timeout, async {
            loop {
                if let Some(receipt) = self.provider.get_transaction_receipt(hash).await? {
                    return Ok::<_, RpcError<TransportErrorKind>>(receipt);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .map_err(|_| TxWaitError::Timeout)??;

        if !receipt.status() {
            return Err(TxWaitError::MinedFailure);
        }

        Ok(())
    }

    async fn listen_for_logs(
        &self,
        cancel: CancellationToken,
        filter: Filter,
        sink: mpsc::Sender<Log>,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut stream = match self.log_stream(&filter).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "error subscribing to logs");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(SUBSCRIBE_RETRY_DELAY) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    log = stream.next() => match log {
                        Some(log) => {
                            if sink.send(log).await.is_err() {
                                // Consumer is gone, nothing left to do.
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }

            // Subscription ended, back off and resubscribe.
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SUBSCRIBE_RETRY_DELAY) => {}
            }
        }
    }

    async fn latest_block(&self) -> TransportResult<u64> {
        self.provider.get_block_number().await
    }

    async fn block_time(&self, number: u64) -> TransportResult<u64> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?
            .ok_or_else(|| TransportErrorKind::custom_str("block not found"))?;
        Ok(block.header.timestamp)
    }

    async fn raw_request(
        &self,
        method: String,
        params: Vec<serde_json::Value>,
    ) -> TransportResult<serde_json::Value> {
        self.provider.raw_request(method.into(), params).await
    }
}

/// Maps a node rejection to the submit error kinds the bundler reacts to:
/// -32010 asks for a replacement, "insufficient funds" retires the batch,
/// -32000 is the node's generic transient failure and stays retryable, any
/// other code is a terminal rejection.
fn classify_submit_error(err: RpcError<TransportErrorKind>) -> TxSubmitError {
    let (code, message) = match err.as_error_resp() {
        Some(payload) => (payload.code, payload.message.to_string()),
        None => return TxSubmitError::Transient(err),
    };

    if code == -32010 {
        return TxSubmitError::ReplacementRequested;
    }

    if message.contains("insufficient funds") {
        return TxSubmitError::InsufficientFunds(message);
    }

    if code == -32000 {
        return TxSubmitError::Transient(err);
    }

    TxSubmitError::Rpc { code, message }
}


#[cfg(test)]
pub(crate) mod mock {
    //! Configurable chain stub shared by the bundler, paymaster and
    //! indexer tests.

    use super::*;
    use alloy::primitives::keccak256;
    use alloy::sol_types::SolValue;
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    /// How [`MockEvm::send_transaction`] reacts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum SubmitBehavior {
        Accept,
        RequestReplacement,
        InsufficientFunds,
        GenericNodeError,
    }

    #[derive(Debug)]
    pub(crate) struct MockEvm {
        pub(crate) chain_nonce: u64,
        /// Addresses `code_at` reports as deployed; `None` deploys
        /// everything.
        pub(crate) deployed: Option<HashSet<Address>>,
        pub(crate) behavior: Mutex<SubmitBehavior>,
        pub(crate) submitted_nonces: Mutex<Vec<u64>>,
        /// Logs fed once into the first `listen_for_logs` subscriber.
        pub(crate) logs_to_stream: Mutex<Vec<Log>>,
        pub(crate) block_times: Mutex<HashMap<u64, u64>>,
    }

    impl MockEvm {
        pub(crate) fn new(chain_nonce: u64) -> Self {
            Self {
                chain_nonce,
                deployed: None,
                behavior: Mutex::new(SubmitBehavior::Accept),
                submitted_nonces: Mutex::new(Vec::new()),
                logs_to_stream: Mutex::new(Vec::new()),
                block_times: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn with_deployed(mut self, deployed: impl IntoIterator<Item = Address>) -> Self {
            self.deployed = Some(deployed.into_iter().collect());
            self
        }
    }

    #[async_trait]
    impl EvmRequester for MockEvm {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn code_at(&self, address: Address) -> TransportResult<Bytes> {
            match &self.deployed {
                Some(deployed) if !deployed.contains(&address) => Ok(Bytes::new()),
                _ => Ok(Bytes::from(vec![0x60])),
            }
        }

        async fn nonce_at(&self, _address: Address) -> TransportResult<u64> {
            Ok(self.chain_nonce)
        }

        async fn base_fee(&self) -> TransportResult<u128> {
            Ok(1_000_000)
        }

        async fn max_priority_fee_per_gas(&self) -> TransportResult<u128> {
            Ok(1_000)
        }

        async fn estimate_gas(
            &self,
            _from: Address,
            _to: Address,
            _data: Bytes,
        ) -> TransportResult<u64> {
            Ok(100_000)
        }

        async fn call(&self, _to: Address, data: Bytes) -> TransportResult<Bytes> {
            // Deterministic digest standing in for a contract view call.
            Ok(keccak256(&data).abi_encode().into())
        }

        async fn new_tx(
            &self,
            nonce: u64,
            _from: Address,
            to: Address,
            data: Bytes,
            extra_gas_tier: u8,
        ) -> Result<TxEip1559, RelayError> {
            let fee = 1_000_000u128 * (1 + extra_gas_tier as u128);
            Ok(TxEip1559 {
                chain_id: 1,
                nonce,
                gas_limit: 150_000,
                max_fee_per_gas: fee,
                max_priority_fee_per_gas: fee,
                to: alloy::primitives::TxKind::Call(to),
                value: U256::ZERO,
                input: data,
                access_list: Default::default(),
            })
        }

        async fn send_transaction(&self, tx: &TxEnvelope) -> Result<(), TxSubmitError> {
            let nonce = match tx {
                TxEnvelope::Eip1559(signed) => signed.tx().nonce,
                _ => 0,
            };

            match *self.behavior.lock().unwrap() {
                SubmitBehavior::Accept => {
                    self.submitted_nonces.lock().unwrap().push(nonce);
                    Ok(())
                }
                SubmitBehavior::RequestReplacement => Err(TxSubmitError::ReplacementRequested),
                SubmitBehavior::InsufficientFunds => Err(TxSubmitError::InsufficientFunds(
                    "insufficient funds for gas * price + value".into(),
                )),
                // Routed through the real classifier so tests exercise the
                // -32000 branch.
                SubmitBehavior::GenericNodeError => {
                    Err(classify_submit_error(RpcError::ErrorResp(
                        alloy::rpc::json_rpc::ErrorPayload {
                            code: -32000,
                            message: "internal error".to_string().into(),
                            data: None,
                        },
                    )))
                }
            }
        }

        async fn wait_for_tx(&self, _hash: B256, timeout: Duration) -> Result<(), TxWaitError> {
            // Never resolves within a test run: in_progress stays populated.
            tokio::time::sleep(timeout + Duration::from_secs(60)).await;
            Ok(())
        }

        async fn listen_for_logs(
            &self,
            cancel: CancellationToken,
            _filter: Filter,
            sink: mpsc::Sender<Log>,
        ) {
            let logs: Vec<Log> = std::mem::take(&mut *self.logs_to_stream.lock().unwrap());
            for log in logs {
                if sink.send(log).await.is_err() {
                    return;
                }
            }
            cancel.cancelled().await;
        }

        async fn latest_block(&self) -> TransportResult<u64> {
            Ok(1)
        }

        async fn block_time(&self, number: u64) -> TransportResult<u64> {
            Ok(self.block_times.lock().unwrap().get(&number).copied().unwrap_or_default())
        }

        async fn raw_request(
            &self,
            _method: String,
            _params: Vec<serde_json::Value>,
        ) -> TransportResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }
}
