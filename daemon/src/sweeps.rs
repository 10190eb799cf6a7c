//! Periodic sweep driver.
//!
//! All timer-driven activity runs in this one cooperative task: the
//! finalization-deadline sweep, the data-verification sweep and the
//! ledger-presence sweep. Every long-running activity in the bot is one of
//! these named sweeps; there is no ambient background concurrency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;

use crate::config::Config;
use crate::handler::ConsumerHandler;

pub struct SweepDriver {
    handler: Arc<ConsumerHandler>,
    running: Arc<AtomicBool>,
    finalization_interval: Duration,
    dv_interval: Duration,
    client_interval: Duration,
}

impl SweepDriver {
    pub fn new(handler: Arc<ConsumerHandler>, config: &Config) -> Self {
        Self {
            handler,
            running: Arc::new(AtomicBool::new(true)),
            finalization_interval: Duration::from_secs(config.finalization_sweep_secs),
            dv_interval: Duration::from_secs(config.dv_sweep_secs),
            client_interval: Duration::from_secs(config.client_sweep_secs),
        }
    }

    /// Flag shared with the caller; clearing it stops the loop after the
    /// current tick.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub async fn run(self) {
        let mut finalization_timer = interval(self.finalization_interval);
        let mut dv_timer = interval(self.dv_interval);
        let mut client_timer = interval(self.client_interval);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = finalization_timer.tick() => {
                    if let Err(e) = self.handler.finalization_sweep().await {
                        warn!("finalization sweep failed: {}", e);
                    }
                }
                _ = dv_timer.tick() => {
                    if let Err(e) = self.handler.data_verification_sweep().await {
                        warn!("data verification sweep failed: {}", e);
                    }
                }
                _ = client_timer.tick() => {
                    if let Err(e) = self.handler.client_presence_sweep().await {
                        warn!("client presence sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("sweep driver stopped");
    }
}
