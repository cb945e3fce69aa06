use std::path::Path;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use nostr::Timestamp;
use tokio::sync::watch;

mod commands;
mod config;
mod dm;
mod error;
mod fsm;
mod listener;
mod lnurl;
mod models;
mod relay;
mod zaps;

use config::{Cli, CliCommand, Config};
use listener::EventLoop;
use models::Db;
use relay::RelayPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Version => {
            println!("eggbot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliCommand::Run { config } => run(&config).await,
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let cfg = Config::load(config_path)?;

    let level = if cfg.file.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    pretty_env_logger::formatted_timed_builder()
        .filter_level(level)
        .parse_default_env()
        .try_init()?;

    info!("eggbot starting...");
    info!("bot npub: {}", cfg.bot_npub);
    info!("relays: {:?}", cfg.file.nostr.relays);
    info!("database: {}", cfg.file.database.path);

    let db = Db::open(&cfg.file.database.path).context("opening database")?;
    info!("database ready");

    let watermark = {
        let mut conn = db.conn()?;
        models::get_high_water_mark(&mut conn)?
    };
    if watermark > 0 {
        info!("high water mark: {watermark}");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
            return;
        }
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    // The protocol's `since` comparator is inclusive, so start one past
    // the last processed event.
    let since = Timestamp::from((watermark + 1) as u64);
    let (pool, streams) = RelayPool::connect(
        &cfg.keys,
        &cfg.file.nostr.relays,
        since,
        shutdown_rx.clone(),
    )
    .await
    .context("connecting to relays")?;

    let exec_cfg = commands::ExecuteConfig {
        sats_per_half_dozen: cfg.file.pricing.sats_per_half_dozen,
        admins: cfg.file.admins.clone(),
        lightning_address: cfg.lightning_address(),
        bot_npub: cfg.bot_npub.clone(),
        lnurl: Some(lnurl::Client::new()),
    };

    let event_loop = EventLoop::new(db, cfg.keys.clone(), pool, exec_cfg, cfg.lnurl_pubkey);
    event_loop.run(streams, shutdown_rx).await?;

    info!("eggbot stopped");
    Ok(())
}
