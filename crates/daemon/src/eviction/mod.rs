//! Background reclamation of expired and orphaned shares.
//!
//! The [`EvictionScheduler`] reconciles the registry with the object store:
//! directories without a record are orphans and get deleted, expired shares
//! lose both directory and record, and everything else is left alone. One
//! sweep runs at start and then once per interval until the scheduler is
//! stopped.
//!
//! A sweep may remove a share while a download of it is in flight; the
//! download then fails with `NotFound`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use protocol::ShareToken;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EvictionConfig;
use crate::error::{ShareError, ShareResult};
use crate::registry::TokenRegistry;
use crate::store::ObjectStore;
use crate::upload::ChunkAssembler;

/// Timing for the eviction loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionSettings {
    /// Whether `start` spawns the loop at all.
    pub enabled: bool,
    /// Delay between successful sweeps.
    pub interval: Duration,
    /// Delay after a sweep that could not run.
    pub retry_delay: Duration,
    /// Age after which an untouched upload session is dropped.
    pub staging_retention: Duration,
}

impl Default for EvictionSettings {
    fn default() -> Self {
        Self::from(&EvictionConfig::default())
    }
}

impl From<&EvictionConfig> for EvictionSettings {
    fn from(config: &EvictionConfig) -> Self {
        Self {
            enabled: config.enabled,
            interval: Duration::from_secs(config.interval_minutes * 60),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            staging_retention: Duration::from_secs(config.staging_retention_hours * 3600),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Directories with no matching record.
    pub orphans_removed: usize,
    /// Expired shares whose directory and record were removed.
    pub expired_removed: usize,
    /// Expired records that never had a directory.
    pub records_removed: usize,
    /// Abandoned upload sessions removed from staging.
    pub staging_removed: usize,
    /// Items that could not be processed.
    pub failures: usize,
}

impl SweepReport {
    /// Number of shares reclaimed.
    pub fn reclaimed(&self) -> usize {
        self.orphans_removed + self.expired_removed + self.records_removed
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic eviction of expired and orphaned shares.
pub struct EvictionScheduler {
    registry: Arc<TokenRegistry>,
    store: Arc<ObjectStore>,
    assembler: Option<Arc<ChunkAssembler>>,
    settings: EvictionSettings,
    task: Mutex<Option<RunningTask>>,
}

impl EvictionScheduler {
    pub fn new(
        registry: Arc<TokenRegistry>,
        store: Arc<ObjectStore>,
        settings: EvictionSettings,
    ) -> Self {
        Self {
            registry,
            store,
            assembler: None,
            settings,
            task: Mutex::new(None),
        }
    }

    /// Also sweep abandoned upload sessions from this assembler.
    pub fn with_assembler(mut self, assembler: Arc<ChunkAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn settings(&self) -> &EvictionSettings {
        &self.settings
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Spawn the background loop.
    ///
    /// Returns `false` without spawning when eviction is disabled or the
    /// loop is already running. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.settings.enabled {
            info!("Eviction disabled, scheduler not started");
            return false;
        }

        let mut slot = self.task_slot();
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!("Eviction scheduler already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_loop(loop_cancel).await;
        });

        *slot = Some(RunningTask { cancel, handle });
        info!(
            interval_secs = self.settings.interval.as_secs(),
            "Eviction scheduler started"
        );
        true
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// A sweep in progress is allowed to finish.
    pub async fn stop(&self) {
        let task = self.task_slot().take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Eviction task ended abnormally");
        }
        info!("Eviction scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let delay = match self.run_now().await {
                Ok(report) => {
                    if report.reclaimed() > 0 || report.failures > 0 {
                        info!(
                            orphans = report.orphans_removed,
                            expired = report.expired_removed,
                            records = report.records_removed,
                            staging = report.staging_removed,
                            failures = report.failures,
                            "Eviction sweep finished"
                        );
                    } else {
                        debug!("Eviction sweep found nothing to reclaim");
                    }
                    self.settings.interval
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_secs = self.settings.retry_delay.as_secs(),
                        "Eviction sweep failed"
                    );
                    self.settings.retry_delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Eviction loop received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one sweep now on the blocking pool.
    pub async fn run_now(self: &Arc<Self>) -> ShareResult<SweepReport> {
        let scheduler = Arc::clone(self);
        tokio::task::spawn_blocking(move || scheduler.sweep())
            .await
            .map_err(|e| ShareError::Storage(format!("sweep task failed: {}", e)))?
    }

    /// Run one sweep on the calling thread.
    ///
    /// Fails only when the object store cannot be enumerated; errors on
    /// individual shares are logged and counted.
    pub fn sweep(&self) -> ShareResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut failed = HashSet::new();

        for name in self.store.list_token_dirs()? {
            if let Some(token) = self.sweep_directory(&name, &mut report) {
                failed.insert(token);
            }
        }

        self.sweep_dirless_records(&mut report, &failed);

        if let Some(assembler) = &self.assembler {
            match assembler.sweep_stale(self.settings.staging_retention) {
                Ok(removed) => report.staging_removed = removed,
                Err(e) => {
                    warn!(error = %e, "Staging sweep failed");
                    report.failures += 1;
                }
            }
        }

        if let Err(e) = self.store.purge_trash() {
            warn!(error = %e, "Failed to purge trash");
        }

        Ok(report)
    }

    /// Reconcile one token directory. Returns the token of an expired share
    /// whose eviction failed so the record pass does not retry it.
    fn sweep_directory(&self, name: &str, report: &mut SweepReport) -> Option<ShareToken> {
        let token = match ShareToken::parse(name) {
            Ok(token) => token,
            Err(_) => {
                self.remove_orphan(name, report);
                return None;
            }
        };

        match self.registry.get(&token) {
            Err(ShareError::NotFound(_)) => self.remove_orphan(name, report),
            Ok(record) if record.is_expired_at(self.registry.now()) => {
                match self.remove_expired(&token) {
                    Ok(()) => {
                        report.expired_removed += 1;
                        info!(token = token.short(), "Evicted expired share");
                    }
                    Err(e) => {
                        warn!(token = token.short(), error = %e, "Failed to evict expired share");
                        report.failures += 1;
                        return Some(token);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(token = token.short(), error = %e, "Failed to look up share");
                report.failures += 1;
            }
        }
        None
    }

    fn remove_orphan(&self, name: &str, report: &mut SweepReport) {
        match self.store.remove_dir_named(name) {
            Ok(true) => {
                report.orphans_removed += 1;
                info!(dir = name, "Removed orphaned share directory");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(dir = name, error = %e, "Failed to remove orphaned directory");
                report.failures += 1;
            }
        }
    }

    fn remove_expired(&self, token: &ShareToken) -> ShareResult<()> {
        self.store.delete_all(token)?;
        self.registry.delete(token)?;
        Ok(())
    }

    fn sweep_dirless_records(&self, report: &mut SweepReport, skip: &HashSet<ShareToken>) {
        let expired = match self.registry.list_expired() {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "Failed to list expired shares");
                report.failures += 1;
                return;
            }
        };

        for record in expired.into_iter().filter(|r| !skip.contains(&r.token)) {
            match self.remove_expired(&record.token) {
                Ok(()) => {
                    report.records_removed += 1;
                    debug!(token = record.token.short(), "Removed expired share record");
                }
                Err(e) => {
                    warn!(token = record.token.short(), error = %e, "Failed to remove expired record");
                    report.failures += 1;
                }
            }
        }
    }
}
