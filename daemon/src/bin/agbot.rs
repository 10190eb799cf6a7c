// Agreement bot daemon entry point.
//
// Wires the store, registry, protocol handler, worker pool, command router
// and sweep driver together, then runs until interrupted. Shutdown is
// cooperative: intake stops first, queued work drains, workers finish
// their current item before exiting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;

use agbot_common::crypto::{open_message, AccountKeys};

use agbot_daemon::config::{Config, DEFAULT_INBOX_POLL_SECS};
use agbot_daemon::exchange::{ExchangeMessenger, HttpExchangeMessenger};
use agbot_daemon::handler::ConsumerHandler;
use agbot_daemon::ledger::RpcLedgerClient;
use agbot_daemon::pattern_manager::PatternManager;
use agbot_daemon::registry::{ClientFactory, ClientRegistry};
use agbot_daemon::router::{CommandRouter, Event};
use agbot_daemon::store::{AgreementStore, MemoryAgreementStore, SledAgreementStore};
use agbot_daemon::sweeps::SweepDriver;
use agbot_daemon::worker::{WorkQueue, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "agbot")]
#[command(about = "Agreement bot daemon", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "agbot.json")]
    config_file: PathBuf,

    /// Log level filter
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,

    /// Use the in-memory agreement store instead of sled
    #[arg(long)]
    memory_store: bool,
}

fn setup_logger(level: log::LevelFilter) -> Result<()> {
    let colors = fern::colors::ColoredLevelConfig::default();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sled", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()
        .context("initializing logger")
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    signing_seed: String,
    exchange_seed: String,
}

/// Load the bot's account keys, generating and persisting a fresh pair on
/// first start.
fn load_or_generate_keys(data_dir: &Path) -> Result<Arc<AccountKeys>> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join("account_keys.json");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let file: KeyFile = serde_json::from_str(&raw).context("parsing key file")?;
        let signing: [u8; 32] = hex::decode(&file.signing_seed)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("signing seed must be 32 bytes"))?;
        let exchange: [u8; 32] = hex::decode(&file.exchange_seed)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("exchange seed must be 32 bytes"))?;
        return Ok(Arc::new(AccountKeys::from_seeds(signing, exchange)));
    }

    let keys = AccountKeys::generate();
    let (signing, exchange) = keys.seeds();
    let file = KeyFile {
        signing_seed: hex::encode(signing),
        exchange_seed: hex::encode(exchange),
    };
    std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;
    info!("generated account {} at {}", keys.address(), path.display());
    Ok(Arc::new(keys))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logger(args.log_level)?;

    let config = Config::load(&args.config_file).context("loading configuration")?;
    let keys = load_or_generate_keys(&config.data_dir)?;
    info!("agbot {} using account {}", config.bot_id, keys.address());

    let store: Arc<dyn AgreementStore> = if args.memory_store {
        Arc::new(MemoryAgreementStore::new())
    } else {
        Arc::new(SledAgreementStore::open(&config.data_dir.join("agreements"))?)
    };

    let account = keys.address();
    let factory: ClientFactory = Box::new(move |_, _, _, endpoint, port| {
        Arc::new(RpcLedgerClient::new(endpoint, port, account.clone()))
    });
    let registry = Arc::new(ClientRegistry::new(&config.protocol, keys.clone(), factory));
    let messenger = Arc::new(HttpExchangeMessenger::new(
        &config.exchange_url,
        &config.bot_id,
        &config.token,
    ));

    let (queue, work_rx) = WorkQueue::new();
    let (container_tx, mut container_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(ConsumerHandler::new(
        config.clone(),
        keys.clone(),
        store,
        registry,
        messenger.clone(),
        queue.clone(),
        container_tx,
    ));

    let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
    let router = CommandRouter::new(handler.clone(), event_rx);
    let router_handle = tokio::spawn(router.run());

    // Inbox poll: unseal waiting messages and hand their payloads to the
    // command router for classification.
    let inbox_handle = {
        let messenger = messenger.clone();
        let keys = keys.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut timer = interval(Duration::from_secs(DEFAULT_INBOX_POLL_SECS));
            loop {
                timer.tick().await;
                let messages = match messenger.poll_inbox().await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("inbox poll failed: {}", e);
                        continue;
                    }
                };
                for message in messages {
                    match open_message(&message.envelope, &keys) {
                        Ok(opened) => {
                            let _ = event_tx.send(Event::NewProtocolMessage {
                                from: message.from.clone(),
                                pub_key: message.pub_key.clone(),
                                message_id: message.message_id.clone(),
                                payload: opened.payload,
                            });
                        }
                        Err(e) => {
                            debug!("dropping undecryptable message {}: {}", message.message_id, e)
                        }
                    }
                    if let Err(e) = messenger.delete_message(&message.message_id).await {
                        warn!("could not delete message {}: {}", message.message_id, e);
                    }
                }
            }
        })
    };

    let pool = WorkerPool::spawn(config.worker_count, work_rx, handler.clone());

    let sweeps = SweepDriver::new(handler.clone(), &config);
    let sweep_stop = sweeps.shutdown_handle();
    let sweep_handle = tokio::spawn(sweeps.run());

    // Ledger client requests go to the deployment's container manager;
    // here they are surfaced in the log for the operator adapter.
    let container_handle = tokio::spawn(async move {
        while let Some(request) = container_rx.recv().await {
            info!(
                "ledger client requested: {}/{}/{}",
                request.org, request.chain_type, request.name
            );
        }
    });

    // Pattern reconciliation runs on its own interval, fetching the
    // defined patterns per served org from the exchange.
    let pattern_handle = {
        let served = config.served_patterns.clone();
        let policy_dir = config.policy_dir.clone();
        let sweep_secs = config.pattern_sweep_secs;
        let messenger = messenger.clone();
        tokio::spawn(async move {
            let mut manager = match PatternManager::new(&policy_dir) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("pattern manager disabled: {}", e);
                    return;
                }
            };
            let mut timer = interval(Duration::from_secs(sweep_secs.max(1)));
            loop {
                timer.tick().await;
                let mut defined = HashMap::new();
                for org in served.iter().map(|sp| sp.org.clone()) {
                    if defined.contains_key(&org) {
                        continue;
                    }
                    match messenger.patterns(&org).await {
                        Ok(map) => {
                            defined.insert(org, map);
                        }
                        Err(e) => warn!("could not fetch patterns for {}: {}", org, e),
                    }
                }
                match manager.reconcile(&served, &defined) {
                    Ok(stats) if stats.files_written > 0 || stats.files_removed > 0 => {
                        info!(
                            "pattern pass: {} created, {} updated, {} deleted",
                            stats.created, stats.updated, stats.deleted
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("pattern reconciliation failed: {}", e),
                }
            }
        })
    };

    info!("agbot started with {} workers", config.worker_count);
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Stop intake, let queued events route, then drain the work channel
    inbox_handle.abort();
    drop(event_tx);
    router_handle.await.ok();
    sweep_stop.store(false, Ordering::SeqCst);
    pattern_handle.abort();
    queue.close();
    pool.join().await;
    sweep_handle.await.ok();
    container_handle.abort();
    info!("agbot stopped");
    Ok(())
}
