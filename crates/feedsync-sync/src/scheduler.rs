use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::Clock;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;
use tracing::{debug, info, warn};

use crate::pipeline::ImportPipeline;
use crate::repository::{FeedRepository, RepositoryError};

pub const HOOK_PREFIX: &str = "feedsync_import_feed_";

pub fn hook_id(feed_id: &str) -> String {
    format!("{HOOK_PREFIX}{feed_id}")
}

pub fn feed_id_from_hook(hook_id: &str) -> Option<&str> {
    hook_id.strip_prefix(HOOK_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("job scheduler: {0}")]
    Jobs(#[from] JobSchedulerError),
}

/// Recurring trigger registry keyed by hook id.
#[async_trait]
pub trait TriggerScheduler: Send + Sync {
    /// First fire at `start_at`, then every `every`. Replaces an existing hook.
    async fn schedule_recurring(
        &self,
        hook_id: &str,
        every: Duration,
        start_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Returns whether a trigger was removed.
    async fn cancel(&self, hook_id: &str) -> Result<bool, SchedulerError>;

    async fn next_fire(&self, hook_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError>;
}

/// What a trigger does when it fires.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn fire(&self, hook_id: &str);
}

/// Runs the import pipeline for the feed named by the hook, unforced.
pub struct PipelineTriggerHandler {
    pipeline: Arc<ImportPipeline>,
}

impl PipelineTriggerHandler {
    pub fn new(pipeline: Arc<ImportPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl TriggerHandler for PipelineTriggerHandler {
    async fn fire(&self, hook_id: &str) {
        let Some(feed_id) = feed_id_from_hook(hook_id) else {
            warn!(hook_id, "trigger fired for unknown hook");
            return;
        };
        let result = self.pipeline.run(feed_id, false).await;
        debug!(
            feed_id,
            success = result.success,
            message = %result.message,
            "scheduled run finished"
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
}

/// Keeps one trigger per enabled feed at the feed's interval.
pub struct FeedScheduler {
    repo: Arc<FeedRepository>,
    triggers: Arc<dyn TriggerScheduler>,
    clock: Arc<dyn Clock>,
}

impl FeedScheduler {
    pub fn new(
        repo: Arc<FeedRepository>,
        triggers: Arc<dyn TriggerScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { repo, triggers, clock }
    }

    /// Clear any trigger and install a fresh one starting now. Missing or
    /// disabled feeds end up with no trigger; returns whether one was installed.
    pub async fn schedule(&self, feed_id: &str) -> Result<bool, SchedulerError> {
        let hook = hook_id(feed_id);
        self.triggers.cancel(&hook).await?;

        let Some(feed) = self.repo.get(feed_id).await? else {
            return Ok(false);
        };
        if !feed.enabled {
            return Ok(false);
        }
        self.triggers
            .schedule_recurring(&hook, feed.interval.period(), self.clock.now())
            .await?;
        info!(feed_id, interval = feed.interval.key(), "feed scheduled");
        Ok(true)
    }

    pub async fn unschedule(&self, feed_id: &str) -> Result<bool, SchedulerError> {
        let removed = self.triggers.cancel(&hook_id(feed_id)).await?;
        if removed {
            info!(feed_id, "feed unscheduled");
        }
        Ok(removed)
    }

    pub async fn reschedule(&self, feed_id: &str) -> Result<bool, SchedulerError> {
        self.unschedule(feed_id).await?;
        self.schedule(feed_id).await
    }

    /// Bring every known feed to its desired trigger state. Idempotent.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, SchedulerError> {
        let mut report = ReconcileReport::default();
        for feed in self.repo.list().await? {
            let present = self.triggers.next_fire(&hook_id(&feed.id)).await?.is_some();
            match (feed.enabled, present) {
                (true, false) => {
                    if self.schedule(&feed.id).await? {
                        report.installed.push(feed.id);
                    }
                }
                (false, true) => {
                    self.unschedule(&feed.id).await?;
                    report.removed.push(feed.id);
                }
                _ => report.unchanged += 1,
            }
        }
        info!(
            installed = report.installed.len(),
            removed = report.removed.len(),
            unchanged = report.unchanged,
            "schedules reconciled"
        );
        Ok(report)
    }

    pub async fn next_fire(&self, feed_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.triggers.next_fire(&hook_id(feed_id)).await
    }
}
