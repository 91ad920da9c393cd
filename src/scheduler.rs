//! Periodic sync driver and the gate it shares with manual syncs.

use async_trait::async_trait;
use futures::future::join_all;
use serenity::all::{ActivityData, Context as SerenityContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::IndexError;
use crate::indexer::{ChannelIndexer, SyncReport};

/// Process-wide lock: at most one sync pipeline runs at a time.
#[derive(Clone, Default)]
pub struct SyncGate(Arc<Mutex<()>>);

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until no other sync holds the gate. Released on drop.
    pub async fn enter(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.0).lock_owned().await
    }

    pub fn is_busy(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// Externally visible "syncing / warning / idle" marker.
#[async_trait]
pub trait StatusIndicator: Send + Sync {
    /// `None` clears the status.
    async fn set(&self, status: Option<&str>);
}

/// Shows the status as the bot's custom presence.
pub struct PresenceStatus {
    ctx: SerenityContext,
}

impl PresenceStatus {
    pub fn new(ctx: SerenityContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl StatusIndicator for PresenceStatus {
    async fn set(&self, status: Option<&str>) {
        self.ctx.set_activity(status.map(|s| ActivityData::custom(s)));
    }
}

pub struct SyncScheduler {
    indexer: Arc<ChannelIndexer>,
    gate: SyncGate,
    status: Arc<dyn StatusIndicator>,
    interval: Duration,
    syncing: String,
    warning: String,
}

impl SyncScheduler {
    pub fn new(
        indexer: Arc<ChannelIndexer>,
        gate: SyncGate,
        status: Arc<dyn StatusIndicator>,
        interval: Duration,
        syncing: impl Into<String>,
        warning: impl Into<String>,
    ) -> Self {
        Self {
            indexer,
            gate,
            status,
            interval,
            syncing: syncing.into(),
            warning: warning.into(),
        }
    }

    /// Runs a cycle now and then every `interval` until `shutdown` flips or its
    /// sender goes away. A failed cycle is logged; the next tick still runs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Sync scheduler started (every {})",
            humantime::format_duration(self.interval)
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(reports) => {
                    let documents: usize = reports.iter().map(|r| r.documents).sum();
                    info!(
                        "Sync cycle finished: {} channels, {} documents",
                        reports.len(),
                        documents
                    );
                }
                Err(e) => error!("Sync cycle failed: {}", e),
            }
        }
        info!("Sync scheduler stopped");
    }

    /// One pass over every enabled channel, holding the gate throughout.
    ///
    /// Channels are collected concurrently and each commits its own watermark,
    /// so one failing channel never undoes another's progress.
    pub async fn run_cycle(&self) -> Result<Vec<SyncReport>, IndexError> {
        let _gate = self.gate.enter().await;
        self.status.set(Some(&self.syncing)).await;

        let channels = match self.indexer.enabled_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                self.status.set(Some(&self.warning)).await;
                return Err(e);
            }
        };
        debug!("Sync cycle over {} channels", channels.len());

        let results = join_all(channels.iter().map(|c| self.indexer.collect(c))).await;

        let total = channels.len();
        let mut reports = Vec::with_capacity(total);
        let mut failed = 0;
        for (channel, result) in channels.iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    failed += 1;
                    error!("Sync of channel {} failed: {}", channel.id, e);
                }
            }
        }

        if failed > 0 {
            self.status.set(Some(&self.warning)).await;
            return Err(IndexError::CycleFailed { failed, total });
        }
        self.status.set(None).await;
        Ok(reports)
    }
}
