mod chain_client;
mod config;
mod entities;
mod error;
mod event_processor;
mod events;
mod notifier;
mod polling;
mod proof_pipeline;
mod prover_client;
mod public_values;
mod queue_root;
mod routes;
mod scanner_client;
mod store;
mod sweeper;
mod tx_builder;
mod tx_queue;
mod types;
mod withdraw;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::{mpsc, watch};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::chain_client::{ChainClient, ChainClientRegistry, ChainProvider, ChainRpc};
use crate::config::{Config, SigningMethod};
use crate::entities::now_epoch;
use crate::event_processor::EventProcessor;
use crate::notifier::ChangeNotifier;
use crate::polling::{PollingService, ReceiptProbe};
use crate::proof_pipeline::ProofPipeline;
use crate::prover_client::ProverClient;
use crate::queue_root::QueueRootManager;
use crate::routes::AppState;
use crate::scanner_client::ScannerClient;
use crate::store::build_store;
use crate::sweeper::TimeoutSweeper;
use crate::tx_builder::{LocalKeySigner, TxSigner};
use crate::tx_queue::TxQueue;
use crate::withdraw::WithdrawOrchestrator;

#[tokio::main]
async fn main() {
    // Initialize tracing (env-filter: RUST_LOG=zkpay_backend=debug,info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zkpay_backend=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[zkpay-backend] configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        host = %config.host,
        port = config.port,
        management_chain = config.management_chain_id,
        networks = config.networks.len(),
        "starting zkpay-backend"
    );

    let store = build_store();
    let notifier = Arc::new(ChangeNotifier::new());

    // Shared RPC clients, one per enabled network.
    let registry = Arc::new(ChainClientRegistry::new(config.chain_id_map()));
    for net in config.networks.iter().filter(|n| n.enabled) {
        registry.register(ChainClient::new(
            net.chain_id,
            net.evm_chain_id,
            net.rpc_endpoints.clone(),
        ));
    }

    let scanner = Arc::new(ScannerClient::new(&config.scanner_url));
    let prover = Arc::new(ProverClient::new(&config.prover_url));
    let queue_roots = Arc::new(QueueRootManager::new(
        store.clone(),
        ScannerClient::new(&config.scanner_url),
    ));

    // Transaction queue with one signer per enabled network. KMS-signed
    // networks are mediated by the external key manager and skipped here.
    let mut tx_queue = TxQueue::new(store.clone(), registry.clone(), &config);
    let mut signer_addresses = Vec::new();
    for net in config.networks.iter().filter(|n| n.enabled) {
        let signer = match net.signing_method {
            SigningMethod::PrivateKey => {
                let key = match config.signer_key_hex(&net.key_alias) {
                    Ok(k) => k,
                    Err(e) => {
                        eprintln!("[zkpay-backend] signer key for chain {}: {e}", net.chain_id);
                        std::process::exit(1);
                    }
                };
                match LocalKeySigner::from_hex(&key) {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        eprintln!("[zkpay-backend] bad signer key for chain {}: {e}", net.chain_id);
                        std::process::exit(1);
                    }
                }
            }
            SigningMethod::Kms => {
                warn!(chain_id = net.chain_id, "kms signing is external, chain not registered for submission");
                continue;
            }
        };
        let contract = config
            .zkpay_contract_for(net.chain_id)
            .expect("validated at startup");
        signer_addresses.push((net.chain_id, signer.address()));
        tx_queue.register_chain(
            net.chain_id,
            net.evm_chain_id,
            signer,
            contract,
            net.gas_price,
            net.effective_gas_limit(),
        );
    }
    let tx_queue = Arc::new(tx_queue);

    let pipeline = Arc::new(ProofPipeline::new(
        store.clone(),
        prover,
        queue_roots.clone(),
        tx_queue.clone(),
        scanner.clone(),
        config.management_chain_id,
    ));
    let polling = Arc::new(PollingService::new(
        store.clone(),
        Arc::new(ReceiptProbe::new(
            store.clone(),
            registry.clone(),
            scanner.clone(),
        )),
    ));
    let sweeper = Arc::new(TimeoutSweeper::new(store.clone()));
    let orchestrator = Arc::new(WithdrawOrchestrator::new(
        store.clone(),
        tx_queue.clone(),
        notifier.clone(),
        config.management_chain_id,
    ));

    // Recover in-flight work before any worker starts.
    if let Err(e) = tx_queue.recover().await {
        error!(error = %e, "tx queue recovery failed");
    }
    if let Err(e) = pipeline.recover().await {
        error!(error = %e, "proof pipeline recovery failed");
    }
    if let Err(e) = polling.recover().await {
        error!(error = %e, "polling recovery failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(1024);

    let processor = Arc::new(EventProcessor::new(
        store.clone(),
        queue_roots.clone(),
        notifier.clone(),
        config.decimal_converter(),
        &config.known_tokens,
        config.allocations_per_checkbook,
    ));

    {
        let processor = Arc::clone(&processor);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { processor.run(event_rx, shutdown).await });
    }
    tokio::spawn(Arc::clone(&pipeline).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&tx_queue).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&polling).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&sweeper).run(shutdown_rx.clone()));
    tokio::spawn(monitor_chains(
        registry.clone(),
        signer_addresses,
        shutdown_rx.clone(),
    ));

    let state = Arc::new(AppState {
        store,
        notifier,
        orchestrator,
        tx_queue,
        event_tx,
        started_at: now_epoch(),
    });

    let app = Router::new()
        .route("/health", axum::routing::get(routes::health))
        .route("/status", axum::routing::get(routes::status))
        .route("/events", axum::routing::post(routes::ingest_event))
        .route(
            "/checkbooks/:chain_id/:deposit_id",
            axum::routing::get(routes::get_checkbook),
        )
        .route(
            "/withdrawals",
            axum::routing::post(routes::create_withdrawal),
        )
        .route("/withdrawals/:id", axum::routing::get(routes::get_withdrawal))
        .route(
            "/withdrawals/:id/cancel",
            axum::routing::post(routes::cancel_withdrawal),
        )
        .route(
            "/withdrawals/:id/execute",
            axum::routing::post(routes::execute_withdrawal),
        )
        .route(
            "/withdrawals/:id/retry-payout",
            axum::routing::post(routes::retry_payout),
        )
        .route(
            "/withdrawals/:id/retry-hook",
            axum::routing::post(routes::retry_hook),
        )
        .route(
            "/withdrawals/:id/retry-fallback",
            axum::routing::post(routes::retry_fallback),
        )
        .route(
            "/failed-transactions",
            axum::routing::get(routes::list_failed_transactions),
        )
        .route(
            "/failed-transactions/:id/retry",
            axum::routing::post(routes::retry_failed_transaction),
        )
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid listen address");
    info!(addr = %addr, "zkpay-backend listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server error");

    info!("zkpay-backend shut down");
}

/// Waits for SIGINT/SIGTERM, then flips the shared shutdown flag so every
/// worker loop exits its select arm.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    let _ = shutdown_tx.send(true);
}

/// RPC-health and signer-balance ticker. The first cycle also verifies
/// that each endpoint reports the EVM chain id the config claims.
async fn monitor_chains(
    registry: Arc<ChainClientRegistry>,
    signers: Vec<(u32, alloy_primitives::Address)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut verified = false;
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        for chain_id in registry.chain_ids() {
            let Some(client) = registry.client_for(chain_id) else {
                continue;
            };
            if !verified {
                match client.network_id().await {
                    Ok(reported) if reported != client.evm_chain_id => {
                        error!(
                            chain_id,
                            configured = client.evm_chain_id,
                            reported,
                            "rpc endpoint reports a different network id"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(chain_id, error = %e, "network id check failed"),
                }
            }
            match client.block_number().await {
                Ok(height) => tracing::debug!(chain_id, height, "rpc healthy"),
                Err(e) => warn!(chain_id, error = %e, "rpc health check failed"),
            }
        }
        for (chain_id, signer) in &signers {
            let Some(client) = registry.client_for(*chain_id) else {
                continue;
            };
            match client.balance_at(*signer).await {
                Ok(balance) => {
                    tracing::debug!(chain_id, signer = %signer, balance = %balance, "signer balance")
                }
                Err(e) => warn!(chain_id, signer = %signer, error = %e, "balance check failed"),
            }
        }
        verified = true;
    }
}
