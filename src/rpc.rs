//! HTTP surface: the legacy JSON-RPC dispatcher, WebSocket subscriptions
//! and the Nostr relay + Blossom listener.

use crate::{
    blossom::BlossomService,
    constants::{MAX_API_BODY_SIZE, MAX_BLOB_SIZE},
    error::RelayError,
    evm::DynEvm,
    nostr::relay::NostrRelay,
    paymaster::{PaymasterService, PaymasterType},
    queue::{Message, QueueHandle},
    storage::RelayStorage,
    types::{Log, UserOpMessage, UserOperation},
    version::RELAY_VERSION,
    ws::ConnectionPools,
};
use alloy::primitives::Address;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsFrame, WebSocket},
        DefaultBodyLimit, Path, Query, RawQuery, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::debug;

/// Chain methods forwarded verbatim to the upstream node.
const PASSTHROUGH_METHODS: [&str; 10] = [
    "eth_chainId",
    "eth_call",
    "eth_blockNumber",
    "eth_getBlockByNumber",
    "eth_maxPriorityFeePerGas",
    "eth_getTransactionReceipt",
    "eth_getTransactionCount",
    "eth_estimateGas",
    "eth_gasPrice",
    "eth_sendRawTransaction",
];

/// Shared state behind the legacy HTTP API.
pub struct ApiState {
    /// Chain facade.
    pub evm: DynEvm,
    /// Event store and side tables.
    pub storage: RelayStorage,
    /// Sponsorship engine.
    pub paymaster: PaymasterService,
    /// Enqueue side of the user-op queue.
    pub userop_queue: QueueHandle,
    /// Broadcast pools for WebSocket subscribers.
    pub pools: Arc<ConnectionPools>,
    /// Prometheus render handle.
    pub metrics: Option<PrometheusHandle>,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState").field("evm", &self.evm).finish_non_exhaustive()
    }
}

/// Builds the legacy HTTP API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .route("/v1/accounts/{acc_addr}/exists", get(account_exists))
        .route("/v1/rpc/{pm_address}", post(rpc_dispatch))
        .route("/v1/rpc", get(rpc_subscribe))
        .route("/v1/events/{contract}/{topic}", get(events_subscribe))
        .route("/v1/logs/{contract}/{topic}", get(list_logs))
        .route("/v1/logs/{contract}/tx/{hash}", get(get_log))
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_API_BODY_SIZE))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn version() -> Json<Value> {
    Json(json!({"version": RELAY_VERSION}))
}

async fn render_metrics(State(state): State<Arc<ApiState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn account_exists(
    State(state): State<Arc<ApiState>>,
    Path(acc_addr): Path<String>,
) -> StatusCode {
    let Ok(address) = acc_addr.parse::<Address>() else {
        return StatusCode::BAD_REQUEST;
    };

    match state.evm.code_at(address).await {
        Ok(code) if !code.is_empty() => StatusCode::OK,
        Ok(_) => StatusCode::NOT_FOUND,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

fn rpc_ok(id: &Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn rpc_err(id: &Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}))
}

/// Maps a relay error onto the JSON-RPC error shape, keeping the upstream
/// code when one was forwarded.
fn rpc_error_response(id: &Value, err: &RelayError) -> Json<Value> {
    if let RelayError::TransientRpc(rpc_err) = err {
        if let Some(payload) = rpc_err.as_error_resp() {
            return self::rpc_err(id, payload.code, &payload.message);
        }
    }
    rpc_err(id, -32000, &err.to_string())
}

async fn rpc_dispatch(
    State(state): State<Arc<ApiState>>,
    Path(pm_address): Path<String>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<Value> {
    let Ok(paymaster) = pm_address.parse::<Address>() else {
        return rpc_err(&request.id, -32602, "invalid paymaster address");
    };

    debug!(method = %request.method, paymaster = %paymaster, "rpc request");

    match request.method.as_str() {
        "pm_sponsorUserOperation" => match sponsor_params(&request.params) {
            Ok((userop, entry_point, pt, _)) => {
                match state.paymaster.sponsor(paymaster, &userop, &entry_point, &pt).await {
                    Ok(data) => rpc_ok(&request.id, json!(data)),
                    Err(err) => rpc_error_response(&request.id, &err),
                }
            }
            Err(err) => rpc_error_response(&request.id, &err),
        },
        "pm_ooSponsorUserOperation" => match sponsor_params(&request.params) {
            Ok((userop, entry_point, pt, amount)) => {
                match state
                    .paymaster
                    .oo_sponsor(paymaster, &userop, &entry_point, &pt, amount)
                    .await
                {
                    Ok(ops) => rpc_ok(&request.id, json!(ops)),
                    Err(err) => rpc_error_response(&request.id, &err),
                }
            }
            Err(err) => rpc_error_response(&request.id, &err),
        },
        "eth_sendUserOperation" => match send_user_operation(&state, paymaster, &request.params).await
        {
            Ok(tx_hash) => rpc_ok(&request.id, tx_hash),
            Err(err) => rpc_error_response(&request.id, &err),
        },
        method if PASSTHROUGH_METHODS.contains(&method) => {
            match state.evm.raw_request(method.to_string(), request.params.clone()).await {
                Ok(result) => rpc_ok(&request.id, result),
                Err(err) => rpc_error_response(&request.id, &RelayError::TransientRpc(err)),
            }
        }
        _ => rpc_err(&request.id, -32601, "method not found"),
    }
}

/// Parses `[userop, entryPoint, type?, amount?]` params shared by the
/// sponsorship methods.
fn sponsor_params(
    params: &[Value],
) -> Result<(UserOperation, String, PaymasterType, usize), RelayError> {
    let userop: UserOperation = params
        .first()
        .cloned()
        .ok_or_else(|| RelayError::validation("error parsing user operation"))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|_| RelayError::validation("error parsing user operation"))
        })?;

    let entry_point = params
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::validation("error parsing entrypoint address"))?
        .to_string();

    let pt: PaymasterType = params
        .get(2)
        .cloned()
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|_| RelayError::validation("error parsing paymaster type"))
        })
        .transpose()?
        .unwrap_or_default();

    let amount = match params.get(3) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(10) as usize,
        Some(Value::String(s)) => s.parse().unwrap_or(10),
        _ => crate::constants::OO_SPONSOR_DEFAULT_AMOUNT,
    };

    Ok((userop, entry_point, pt, amount))
}

/// Validates a sponsored op and runs it through the bundler queue,
/// responding with the bundle transaction hash.
async fn send_user_operation(
    state: &ApiState,
    paymaster: Address,
    params: &[Value],
) -> Result<Value, RelayError> {
    let (userop, entry_point, _, _) = sponsor_params(params)?;

    let code = state.evm.code_at(paymaster).await?;
    if code.is_empty() {
        return Err(RelayError::validation("paymaster contract not deployed"));
    }

    state.paymaster.verify_sponsorship(paymaster, &userop).await?;

    let entry_point: Address = entry_point
        .parse()
        .map_err(|_| RelayError::validation("invalid entry point address"))?;

    let data = params.get(2).filter(|v| v.is_object()).cloned();
    let extra_data = params.get(3).filter(|v| v.is_object()).cloned();

    let (message, response) = Message::for_userop(UserOpMessage {
        paymaster,
        entry_point,
        chain_id: state.evm.chain_id(),
        userop,
        data,
        extra_data,
        bump_gas: 0,
    });

    state.userop_queue.enqueue(message)?;
    response.wait().await
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(rename = "maxDate")]
    max_date: Option<i64>,
}

fn default_limit() -> i64 {
    10
}

async fn list_logs(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let max_date = query.max_date.unwrap_or_else(|| chrono::Utc::now().timestamp());

    let events = match state
        .storage
        .list_log_events(&contract, &topic, max_date, query.limit, query.offset)
        .await
    {
        Ok(events) => events,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let logs: Vec<Log> = events
        .iter()
        .filter_map(|ev| serde_json::from_str(&ev.content).ok())
        .collect();

    Json(json!(logs)).into_response()
}

async fn get_log(
    State(state): State<Arc<ApiState>>,
    Path((_contract, hash)): Path<(String, String)>,
) -> Response {
    let chain_id = state.evm.chain_id().to_string();

    let event = match state.storage.get_log_event(&chain_id, &hash).await {
        Ok(Some(event)) => event,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let Ok(mut log) = serde_json::from_str::<Log>(&event.content) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    // Attach the quoted description when one was posted for this log.
    if let Ok(Some(mention)) = state.storage.get_mention_event(&event.id.to_hex()).await {
        log.extra_data = Some(json!({"description": mention.content}));
    }

    Json(json!(log)).into_response()
}

async fn rpc_subscribe(
    State(state): State<Arc<ApiState>>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let pools = Arc::clone(&state.pools);
    ws.on_upgrade(move |socket| serve_pool_socket(pools, "rpc".to_string(), query, socket))
}

async fn events_subscribe(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let pool_id = format!("{contract}/{topic}").to_lowercase();
    let pools = Arc::clone(&state.pools);
    ws.on_upgrade(move |socket| serve_pool_socket(pools, pool_id, query, socket))
}

/// Pumps pool broadcasts into one WebSocket until the client leaves.
async fn serve_pool_socket(
    pools: Arc<ConnectionPools>,
    pool_id: String,
    query: Option<String>,
    socket: WebSocket,
) {
    let (_subscription, mut rx) = pools.connect(&pool_id, query.as_deref().unwrap_or(""));
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(WsFrame::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsFrame::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    // Dropping the subscription removes the connection from the pool.
}

/// Builds the Nostr relay + Blossom router served on the relay port.
pub fn relay_router(relay: Arc<NostrRelay>, blossom: Option<Arc<BlossomService>>) -> Router {
    let state = RelayState { relay, blossom };

    Router::new()
        .route("/", get(relay_root))
        .route("/upload", put(blob_upload))
        .route("/{sha256}", get(blob_get).delete(blob_delete))
        .layer(CorsLayer::permissive())
        // Oversized uploads are refused before the body is buffered; the
        // axum default limit is disabled so the 50 MiB cap governs.
        .layer(RequestBodyLimitLayer::new(MAX_BLOB_SIZE))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[derive(Debug, Clone)]
struct RelayState {
    relay: Arc<NostrRelay>,
    blossom: Option<Arc<BlossomService>>,
}
#[axum::debug_handler]

async fn relay_root(
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let relay = Arc::clone(&state.relay);
        return ws.on_upgrade(move |socket| relay.handle_socket(socket));
    }

    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/nostr+json"));
    if wants_info {
        return Json(state.relay.info_document()).into_response();
    }

    "oprelay nostr relay\n".into_response()
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
}

async fn blob_upload(
    State(state): State<RelayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(blossom) = &state.blossom else {
        return (StatusCode::SERVICE_UNAVAILABLE, "blob storage is not configured").into_response();
    };

    let group_id = match blossom.check_upload(auth_header(&headers), &body).await {
        Ok(group_id) => group_id,
        Err(rej) => return rejection_response(rej),
    };

    match blossom.store_blob(group_id.as_deref(), body.to_vec()).await {
        Ok(descriptor) => Json(json!(descriptor)).into_response(),
        Err(rej) => rejection_response(rej),
    }
}

async fn blob_get(State(state): State<RelayState>, Path(sha256): Path<String>) -> Response {
    let Some(blossom) = &state.blossom else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    // A file extension is accepted and ignored.
    let sha256 = sha256.split('.').next().unwrap_or(&sha256).to_string();

    match blossom.load_blob(&sha256).await {
        Ok((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(rej) => rejection_response(rej),
    }
}

async fn blob_delete(
    State(state): State<RelayState>,
    Path(sha256): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(blossom) = &state.blossom else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    match blossom.delete_blob(auth_header(&headers), &sha256).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(rej) => rejection_response(rej),
    }
}

fn rejection_response(rej: crate::blossom::BlobRejection) -> Response {
    let status = StatusCode::from_u16(rej.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, rej.reason).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sponsor_params() {
        let params = vec![
            json!({"sender": "0x0000000000000000000000000000000000000001"}),
            json!("0x0000000000000000000000000000000000000002"),
            json!({"type": "cw-safe"}),
            json!(25),
        ];

        let (userop, entry_point, pt, amount) = sponsor_params(&params).unwrap();
        assert_eq!(
            userop.sender.to_string(),
            "0x0000000000000000000000000000000000000001"
        );
        assert_eq!(entry_point, "0x0000000000000000000000000000000000000002");
        assert_eq!(pt.kind, "cw-safe");
        assert_eq!(amount, 25);
    }

    #[test]
    fn sponsor_params_default_amount_and_type() {
        let params = vec![json!({}), json!("0xep")];
        let (_, _, pt, amount) = sponsor_params(&params).unwrap();
        assert_eq!(pt.kind, "");
        assert_eq!(amount, crate::constants::OO_SPONSOR_DEFAULT_AMOUNT);

        // Amount may also arrive as a string.
        let params = vec![json!({}), json!("0xep"), json!({}), json!("7")];
        let (_, _, _, amount) = sponsor_params(&params).unwrap();
        assert_eq!(amount, 7);
    }

    #[test]
    fn sponsor_params_require_entrypoint() {
        let err = sponsor_params(&[json!({})]).unwrap_err();
        assert!(err.to_string().contains("entrypoint"));
    }

    #[test]
    fn rpc_errors_keep_upstream_codes() {
        use alloy::{rpc::json_rpc::ErrorPayload, transports::RpcError};

        let err = RelayError::TransientRpc(RpcError::ErrorResp(ErrorPayload {
            code: -32015,
            message: "execution reverted".to_string().into(),
            data: None,
        }));

        let Json(body) = rpc_error_response(&json!(1), &err);
        assert_eq!(body["error"]["code"], -32015);

        let Json(body) = rpc_error_response(&json!(1), &RelayError::validation("nope"));
        assert_eq!(body["error"]["code"], -32000);
        assert_eq!(body["error"]["message"], "nope");
    }
}
