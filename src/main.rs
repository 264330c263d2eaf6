//! Pancho backend: blockchain-escrowed up/down price-prediction rounds.
//!
//! Wires the durable ledger, oracle port, settlement engine, keeper and
//! HTTP surface together from environment configuration.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pancho_backend::api::{create_router, AppState};
use pancho_backend::engine::join::JoinHandler;
use pancho_backend::engine::keeper::Keeper;
use pancho_backend::engine::oracle::{OraclePort, RpcOracleSource};
use pancho_backend::engine::round::RoundSchedule;
use pancho_backend::engine::settlement::{SettlementConfig, SettlementEngine};
use pancho_backend::engine::sqlite_ledger::SqliteLedger;
use pancho_backend::engine::transfer::{PaperDepositVerifier, PaperTransferFacility};
use pancho_backend::middleware::{RateLimitConfig, RateLimitLayer};
use pancho_backend::models::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    // Treasury hard lock: refuse to start rather than pay a wrong wallet.
    config.check_treasury_lock()?;

    let schedule = RoundSchedule::new(
        config.open_seconds,
        config.lock_seconds,
        config.settle_seconds,
    )
    .map_err(|e| anyhow::anyhow!("invalid round schedule: {}", e))?;

    let ledger = Arc::new(SqliteLedger::open(&config.database_path)?);

    let accounts: HashMap<_, _> = config
        .markets
        .iter()
        .map(|m| (m.symbol, m.oracle_account.clone()))
        .collect();
    let oracle = Arc::new(OraclePort::new(
        Arc::new(RpcOracleSource::new(config.rpc_url.clone(), accounts)),
        config.oracle_max_age_sec,
    ));

    // The wallet signing client is an external collaborator; deployments
    // plug a real facility here. The paper facility keeps simulation runs
    // end-to-end exercisable.
    let transfers = Arc::new(PaperTransferFacility::new());
    if config.escrow_wallet.is_some() {
        warn!("custody mode configured with the paper transfer facility; payouts are simulated");
    }

    let engine = Arc::new(SettlementEngine::new(
        ledger.clone(),
        oracle.clone(),
        transfers,
        config.markets.clone(),
        SettlementConfig {
            fee_bps: config.fee_bps,
            treasury_wallet: config.treasury_wallet.clone(),
            round_lock_ttl: Duration::from_secs(config.round_lock_ttl_secs),
        },
    ));

    let join = Arc::new(JoinHandler::new(
        ledger.clone(),
        Arc::new(PaperDepositVerifier),
        config.clone(),
        schedule,
    ));

    let keeper = Arc::new(Keeper::new(
        ledger.clone(),
        oracle.clone(),
        engine.clone(),
        config.clone(),
        schedule,
    ));
    tokio::spawn(async move {
        if let Err(e) = keeper.run().await {
            // Only the treasury hard lock terminates the keeper.
            tracing::error!(error = %e, "keeper aborted");
        }
    });

    let limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: config.api_rate_limit,
        window: Duration::from_secs(config.api_rate_window_secs),
    });
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            loop {
                ticker.tick().await;
                limiter.cleanup();
            }
        });
    }

    let state = AppState::new(config.clone(), ledger, oracle, join, engine);
    let app = create_router(state, limiter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, markets = config.markets.len(), "pancho backend listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server exited")
}
