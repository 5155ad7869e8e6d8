mod broadcast;
mod cache;
mod clock;
mod config;
mod error;
mod feeder_adapter;
mod herd;
mod messages;
mod metrics;
mod model;
mod nostr_adapter;
mod payout;
mod payout_calc;
mod recovery;
mod retry;
mod split_sync;
mod store;
mod wallet_adapter;
mod ws_consumer;
mod zap_pipeline;

use clap::Parser;
use config::{AppConfig, Cli};
use messages::PlainTemplates;
use std::sync::Arc;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Some(path) = &cli.env_file {
        if let Err(e) = dotenvy::from_path(path) {
            tracing::warn!(path, error = %e, "env file not found or unreadable; continuing with process environment only");
        }
    }

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    let store = store::Store::open(&config.store_path)?;
    let cache = cache::Cache::new(store.clone());

    let nostr = Arc::new(nostr_adapter::NostrAdapter::connect(&config.self_secret_hex, &config.default_relays).await?);
    let wallet = Arc::new(wallet_adapter::WalletAdapter::new(
        config.wallet_api_base_url.clone(),
        config.main_wallet_key.clone(),
        config.split_wallet_key.clone(),
    )?);
    let feeder = Arc::new(feeder_adapter::FeederAdapter::new(
        config.feeder_base_url.clone(),
        config.feeder_username.clone(),
        config.feeder_password.clone(),
    )?);

    let herd_engine = Arc::new(herd::HerdEngine::new(store.clone(), cache.clone(), config.max_herd_size, config.headbutt_min_sats));
    let split_sync = Arc::new(split_sync::SplitSynchronizer::new(
        store.clone(),
        cache.clone(),
        (*wallet).clone(),
        config.predefined_wallet_address.clone(),
        config.predefined_wallet_alias.clone(),
    ));
    let metrics = Arc::new(metrics::Metrics::load(store.clone()).await?);
    let broadcast = Arc::new(broadcast::Broadcast::new());
    let templates: Arc<dyn messages::MessageTemplates> = Arc::new(PlainTemplates);

    let initial_balance = wallet.read_balance().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to read initial wallet balance; starting at 0");
        0
    });
    let balance = Arc::new(Mutex::new(initial_balance));

    let payout = Arc::new(payout::PayoutOrchestrator::new(split_sync.clone(), wallet.clone(), metrics.clone(), balance.clone()));

    let pipeline = zap_pipeline::ZapPipeline::new(
        store.clone(),
        herd_engine.clone(),
        nostr.clone(),
        feeder.clone(),
        split_sync.clone(),
        payout.clone(),
        metrics.clone(),
        broadcast.clone(),
        templates.clone(),
        cache.clone(),
        balance.clone(),
        config.trigger_amount_sats,
    );

    if !cli.skip_recovery {
        recovery::run(&nostr, &store, &pipeline).await;
    } else {
        tracing::info!("skipping missed-zap recovery (--skip-recovery)");
    }

    let ws_task = tokio::spawn(ws_consumer::run(config.zap_feed_ws_url.clone(), pipeline.clone()));

    let reset_herd = herd_engine.clone();
    let reset_metrics = metrics.clone();
    let reset_task = tokio::spawn(clock::run_daily_reset_loop(move || {
        let herd = reset_herd.clone();
        let metrics = reset_metrics.clone();
        async move {
            if let Err(e) = herd.daily_reset().await {
                tracing::error!(error = %e, "daily herd reset failed");
            }
            if let Err(e) = metrics.reset_session().await {
                tracing::error!(error = %e, "daily metrics reset failed");
            }
            tracing::info!("daily reset complete");
        }
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    ws_task.abort();
    reset_task.abort();
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

