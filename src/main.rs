use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};

use etrid_bridge::adapters::{AdapterRegistry, ChainAdapter, EvmAdapter, EvmAdapterConfig, InMemoryChain};
use etrid_bridge::api::{self, AppState};
use etrid_bridge::config::Config;
use etrid_bridge::metrics;
use etrid_bridge::relayer::Relayer;
use etrid_bridge::service::AttestationService;
use etrid_bridge::signing::{LocalSigner, WatchtowerSet};
use etrid_bridge::store::{postgres, AttestationStore, MemoryStore, PostgresStore};
use etrid_bridge::types::{ChainAddress, ChainFamily, ChainId};
use etrid_bridge::watchers::{ChainWatcher, WatcherManager};
use etrid_bridge::watchtower::{HttpWatchtower, LocalWatchtower, Watchtower};

/// Timeout for a single remote watchtower signing request
const WATCHTOWER_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    // Initialize logging
    init_logging();

    tracing::info!("Starting Etrid Bridge attestation service");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        threshold = config.signature_threshold,
        watchtowers = config.watchtowers.len(),
        chains = config.chains.len(),
        relayer_enabled = config.relayer.enabled,
        "Configuration loaded"
    );

    let watchtower_set = Arc::new(config.watchtower_set()?);

    // Attestation store
    let store: Arc<dyn AttestationStore> = match &config.database_url {
        Some(url) => {
            let pool = postgres::create_pool(url).await?;
            tracing::info!("Database connected");
            postgres::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Arc::new(PostgresStore::new(pool, watchtower_set.clone()))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory attestation store");
            Arc::new(MemoryStore::new(watchtower_set.clone()))
        }
    };

    let (adapters, finality) = build_adapters(&config, &watchtower_set)?;
    let watchtowers = build_watchtowers(&config)?;

    let service = Arc::new(AttestationService::new(
        store.clone(),
        adapters.clone(),
        watchtowers,
        config.service_config(),
    ));

    let watcher_manager = WatcherManager::new(
        adapters
            .chain_ids()
            .into_iter()
            .filter_map(|chain_id| {
                let adapter = adapters.get(chain_id).ok()?;
                let finality_blocks = finality.iter().find(|(id, _)| *id == chain_id)?.1;
                Some(ChainWatcher::new(
                    adapter,
                    service.clone(),
                    finality_blocks,
                    config.poll_interval(),
                ))
            })
            .collect(),
    );

    let relayer = Relayer::new(
        store.clone(),
        adapters.clone(),
        config.retry_config(),
        config.poll_interval(),
    );

    // Create shutdown channels
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, shutdown_rx2) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx3, shutdown_rx3) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx4, shutdown_rx4) = tokio::sync::mpsc::channel::<()>(1);

    // Setup signal handlers
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
        let _ = shutdown_tx2.send(()).await;
        let _ = shutdown_tx3.send(()).await;
        let _ = shutdown_tx4.send(()).await;
    });

    // Start API server
    let api_addr = config.bind_address()?;
    let api_state = AppState {
        service: service.clone(),
    };
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(api_addr, api_state, shutdown_rx4).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    metrics::UP.set(1.0);
    tracing::info!("Service initialized, starting processing");

    let relayer_enabled = config.relayer.enabled;
    let relayer_task = async move {
        if relayer_enabled {
            relayer.run(shutdown_rx2).await
        } else {
            tracing::info!("Relayer disabled; ready attestations are served over HTTP only");
            let mut shutdown = shutdown_rx2;
            shutdown.recv().await;
            Ok(())
        }
    };

    let sweep_interval = config.poll_interval().max(Duration::from_secs(5));

    // Run watchers, relayer, and pending sweep concurrently
    tokio::select! {
        result = watcher_manager.run(shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Watcher manager error");
            }
        }
        result = relayer_task => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relayer error");
            }
        }
        result = service.run_sweeper(sweep_interval, shutdown_rx3) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Pending sweeper error");
            }
        }
    }

    metrics::UP.set(0.0);
    let _ = api_handle.await;

    tracing::info!("Etrid Bridge attestation service stopped");
    Ok(())
}

/// Build one adapter per enabled chain, with its finality depth
fn build_adapters(
    config: &Config,
    watchtowers: &Arc<WatchtowerSet>,
) -> eyre::Result<(AdapterRegistry, Vec<(ChainId, u64)>)> {
    let mut registry = AdapterRegistry::new();
    let mut finality = Vec::new();

    for chain in config.enabled_chains() {
        let family = chain
            .family()
            .ok_or_else(|| eyre!("chain {} is not in the domain registry", chain.chain_id))?;

        let adapter: Arc<dyn ChainAdapter> = if chain.is_in_memory() {
            let token = match (family, chain.token_address.is_empty()) {
                (_, false) => ChainAddress::from_hex(&chain.token_address)
                    .wrap_err_with(|| format!("Invalid token address for {}", chain.name))?,
                (ChainFamily::Evm, true) => ChainAddress::Evm([0u8; 20]),
                (ChainFamily::Substrate, true) => ChainAddress::Substrate([0u8; 32]),
            };
            let ledger = InMemoryChain::new(chain.chain_id, token, watchtowers.clone());
            tracing::warn!(chain = %chain.name, chain_id = %chain.chain_id, "Using in-memory ledger");
            Arc::new(ledger.adapter(token))
        } else {
            Arc::new(EvmAdapter::new(&EvmAdapterConfig {
                chain_id: chain.chain_id,
                rpc_url: chain.rpc_url.clone(),
                messenger_address: chain.messenger_address.clone(),
                token_address: chain.token_address.clone(),
                private_key: chain.private_key.clone(),
            })?)
        };

        tracing::info!(
            chain = %chain.name,
            chain_id = %chain.chain_id,
            family = %family,
            finality_blocks = chain.finality_blocks,
            "Chain adapter configured"
        );
        registry.register(adapter);
        finality.push((chain.chain_id, chain.finality_blocks));
    }

    Ok((registry, finality))
}

/// Local signer when a key is configured, otherwise the remote endpoint
fn build_watchtowers(config: &Config) -> eyre::Result<Vec<Arc<dyn Watchtower>>> {
    let mut clients: Vec<Arc<dyn Watchtower>> = Vec::new();

    for wt in &config.watchtowers {
        if let Some(private_key) = config.watchtower_private_key(&wt.id) {
            let signer = LocalSigner::from_hex(wt.scheme, private_key)
                .wrap_err_with(|| format!("Invalid private key for watchtower {}", wt.id))?;
            if hex::encode(signer.identity()) != wt.public_key.trim_start_matches("0x").to_lowercase() {
                return Err(eyre!(
                    "private key for watchtower {} does not match its public key",
                    wt.id
                ));
            }
            clients.push(Arc::new(LocalWatchtower::new(wt.id.clone(), signer)));
        } else if let Some(url) = &wt.url {
            clients.push(Arc::new(HttpWatchtower::new(
                wt.id.clone(),
                url.clone(),
                WATCHTOWER_TIMEOUT,
            )?));
        } else {
            tracing::info!(
                watchtower = %wt.id,
                "No key or url configured; expecting pushed signatures"
            );
        }
    }

    Ok(clients)
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,etrid_bridge=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
