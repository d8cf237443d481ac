//! Relay startup wiring.

use crate::{
    blossom::{BlossomConfig, BlossomService},
    cli::Args,
    config::{AwsConfig, RelayConfig},
    constants::{RELAY_PORT, USEROP_QUEUE_RETRIES},
    error::RelayError,
    evm::{DynEvm, EvmClient},
    indexer::Indexer,
    metrics::build_exporter,
    nostr::{groups::GroupsService, relay::{NostrRelay, RelayInfo}, NostrService},
    paymaster::PaymasterService,
    queue::{PushNotifier, QueueService, UserOpBundler},
    rpc::{api_router, relay_router, ApiState},
    storage::RelayStorage,
    version::RELAY_VERSION,
    webhook::WebhookNotifier,
    ws::ConnectionPools,
};
use eyre::Context;
use nostr::Keys;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Brings the whole relay up and runs it until ctrl-c or a fatal error.
pub async fn try_spawn(args: Args) -> eyre::Result<()> {
    if let Some(path) = &args.env {
        dotenvy::from_path(path)
            .wrap_err_with(|| format!("failed to load env file {}", path.display()))?;
    }
    let config = RelayConfig::from_env()?;

    let cancel = CancellationToken::new();
    let metrics_handle = build_exporter()?;

    let storage = RelayStorage::connect_pg(
        &config.database_url(),
        &config.reader_database_url(),
        &config.db_secret,
    )
    .await
    .wrap_err("failed to connect to the database")?;
    storage.migrate().await.wrap_err("failed to prepare the schema")?;

    let evm: DynEvm = Arc::new(
        EvmClient::connect(&config.rpc_url, &config.rpc_ws_url, args.polling)
            .await
            .wrap_err("failed to connect to the chain")?,
    );
    info!(chain_id = evm.chain_id(), chain = %config.chain_name, version = RELAY_VERSION,
        "starting relay");

    let keys = Keys::parse(&config.relay_private_key).wrap_err("invalid RELAY_PRIVATE_KEY")?;
    let nostr = NostrService::new(keys, storage.clone(), config.relay_url.clone());
    let pools = Arc::new(ConnectionPools::new());
    let webhook =
        WebhookNotifier::new(config.discord_url.clone(), config.chain_name.clone(), args.notify);

    // The bundler consumes the user-op queue; one serial worker keeps the
    // per-sponsor nonce sequencing sound.
    let (userop_service, userop_queue, userop_errors) =
        QueueService::new("userop", USEROP_QUEUE_RETRIES, args.buffer, cancel.clone());
    let bundler = UserOpBundler::new(
        Arc::clone(&evm),
        storage.clone(),
        nostr.clone(),
        Arc::clone(&pools),
    );
    tokio::spawn(userop_service.start(bundler));

    let (push_service, _push_queue, push_errors) =
        QueueService::new("push", 3, args.buffer, cancel.clone());
    tokio::spawn(push_service.start(PushNotifier::new()));

    spawn_error_pump(userop_errors, webhook.clone());
    spawn_error_pump(push_errors, webhook.clone());

    let groups = GroupsService::new(storage.clone(), nostr.clone());
    let relay = NostrRelay::new(
        storage.clone(),
        groups.clone(),
        RelayInfo {
            name: config.relay_info_name.clone(),
            description: config.relay_info_description.clone(),
            icon: config.relay_info_icon.clone(),
        },
        nostr.public_key_hex(),
    );

    let blossom = match &config.aws {
        Some(aws) => Some(Arc::new(build_blossom(aws, &config, groups.clone()).await)),
        None => None,
    };

    let (quit_tx, mut quit_rx) = mpsc::channel::<eyre::Report>(1);

    if !args.noindex {
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&evm),
            storage.clone(),
            nostr.clone(),
            Arc::clone(&pools),
            cancel.clone(),
        ));
        let quit = quit_tx.clone();
        let webhook = webhook.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.start().await {
                webhook.notify_error(&err.to_string()).await;
                let _ = quit.send(eyre::eyre!(err)).await;
            }
        });
    }

    let api_state = Arc::new(ApiState {
        evm: Arc::clone(&evm),
        storage: storage.clone(),
        paymaster: PaymasterService::new(Arc::clone(&evm), storage.clone()),
        userop_queue,
        pools: Arc::clone(&pools),
        metrics: Some(metrics_handle),
    });

    serve(api_router(api_state), args.port, cancel.clone(), quit_tx.clone()).await?;
    serve(relay_router(relay, blossom), RELAY_PORT, cancel.clone(), quit_tx).await?;

    webhook.notify("relay started").await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            cancel.cancel();
            Ok(())
        }
        err = quit_rx.recv() => {
            cancel.cancel();
            match err {
                Some(err) => {
                    error!(%err, "fatal error");
                    Err(err)
                }
                None => Ok(()),
            }
        }
    }
}

/// Binds a listener and serves the router in the background; bind errors
/// are immediate, serve errors surface on the quit channel.
async fn serve(
    router: axum::Router,
    port: u16,
    cancel: CancellationToken,
    quit: mpsc::Sender<eyre::Report>,
) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(err) = result {
            let _ = quit.send(eyre::eyre!(err)).await;
        }
    });

    Ok(())
}

/// Forwards queue errors to the operator webhook: capacity pressure as
/// warnings, everything else as errors.
fn spawn_error_pump(
    mut errors: mpsc::UnboundedReceiver<RelayError>,
    webhook: WebhookNotifier,
) {
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            match &err {
                RelayError::QueueAlmostFull(_) | RelayError::QueueFull(_) => {
                    webhook.notify_warning(&err.to_string()).await;
                }
                _ => webhook.notify_error(&err.to_string()).await,
            }
        }
    });
}

async fn build_blossom(
    aws: &AwsConfig,
    config: &RelayConfig,
    groups: GroupsService,
) -> BlossomService {
    let credentials = aws_sdk_s3::config::Credentials::new(
        aws.access_key_id.clone(),
        aws.secret_access_key.clone(),
        None,
        None,
        "env",
    );

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(aws.region.clone()))
        .credentials_provider(credentials)
        .load()
        .await;

    let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
    if let Some(endpoint) = &aws.endpoint_url {
        // Path-style addressing is what most S3-compatible stores expect.
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    let client = aws_sdk_s3::Client::from_conf(builder.build());

    BlossomService::new(
        client,
        BlossomConfig { bucket: aws.bucket.clone(), service_url: config.relay_url.clone() },
        groups,
    )
}
