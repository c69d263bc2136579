use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error};
use uuid::Uuid;

use crate::scheduler::{SchedulerError, TriggerHandler, TriggerScheduler};

struct HookJobs {
    /// One-shot job covering the first fire at `start_at`.
    kickoff: Uuid,
    /// Installed by the kickoff so the cadence counts from `start_at`.
    recurring: Option<Uuid>,
    every: Duration,
    start_at: DateTime<Utc>,
}

type HookTable = Arc<Mutex<HashMap<String, HookJobs>>>;

/// Triggers backed by a running `tokio-cron-scheduler` instance.
pub struct CronTriggerScheduler {
    sched: JobScheduler,
    handler: Arc<dyn TriggerHandler>,
    hooks: HookTable,
}

impl CronTriggerScheduler {
    pub fn new(sched: JobScheduler, handler: Arc<dyn TriggerHandler>) -> Self {
        Self {
            sched,
            handler,
            hooks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn remove_jobs(&self, jobs: &HookJobs) -> Result<(), SchedulerError> {
        // Already-fired one-shot jobs may be gone.
        if let Err(err) = self.sched.remove(&jobs.kickoff).await {
            debug!(error = ?err, "kickoff job already removed");
        }
        if let Some(recurring) = jobs.recurring {
            self.sched.remove(&recurring).await?;
        }
        Ok(())
    }
}

fn repeating_job(
    handler: Arc<dyn TriggerHandler>,
    hook: String,
    every: Duration,
) -> Result<Job, SchedulerError> {
    let job = Job::new_repeated_async(every, move |_job_id, _sched| {
        let handler = handler.clone();
        let hook = hook.clone();
        Box::pin(async move {
            handler.fire(&hook).await;
        })
    })?;
    Ok(job)
}

/// Add the recurring job for `hook` if `kickoff` is still its current kickoff.
/// Returns false for a kickoff left over from a replaced or cancelled trigger.
async fn install_recurring(
    hooks: &HookTable,
    sched: &JobScheduler,
    handler: Arc<dyn TriggerHandler>,
    hook: &str,
    kickoff: Uuid,
) -> Result<bool, SchedulerError> {
    let mut hooks = hooks.lock().await;
    let Some(jobs) = hooks.get_mut(hook).filter(|jobs| jobs.kickoff == kickoff) else {
        return Ok(false);
    };
    if jobs.recurring.is_none() {
        let job = repeating_job(handler, hook.to_string(), jobs.every)?;
        jobs.recurring = Some(sched.add(job).await?);
        debug!(hook_id = hook, "recurring trigger installed");
    }
    Ok(true)
}

#[async_trait]
impl TriggerScheduler for CronTriggerScheduler {
    async fn schedule_recurring(
        &self,
        hook_id: &str,
        every: Duration,
        start_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut hooks = self.hooks.lock().await;
        if let Some(existing) = hooks.remove(hook_id) {
            self.remove_jobs(&existing).await?;
        }

        let table = self.hooks.clone();
        let handler = self.handler.clone();
        let hook = hook_id.to_string();
        let delay = (start_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let kickoff = Job::new_one_shot_async(delay, move |job_id, sched| {
            let table = table.clone();
            let handler = handler.clone();
            let hook = hook.clone();
            Box::pin(async move {
                match install_recurring(&table, &sched, handler.clone(), &hook, job_id).await {
                    Ok(true) => handler.fire(&hook).await,
                    Ok(false) => debug!(hook_id = %hook, "stale kickoff ignored"),
                    Err(err) => {
                        error!(
                            hook_id = %hook,
                            error = %err,
                            "installing recurring trigger failed"
                        );
                        handler.fire(&hook).await;
                    }
                }
            })
        })?;
        let kickoff = self.sched.add(kickoff).await?;

        hooks.insert(
            hook_id.to_string(),
            HookJobs {
                kickoff,
                recurring: None,
                every,
                start_at,
            },
        );
        debug!(hook_id, every_secs = every.as_secs(), "trigger installed");
        Ok(())
    }

    async fn cancel(&self, hook_id: &str) -> Result<bool, SchedulerError> {
        let mut hooks = self.hooks.lock().await;
        let Some(jobs) = hooks.remove(hook_id) else {
            return Ok(false);
        };
        self.remove_jobs(&jobs).await?;
        debug!(hook_id, "trigger cancelled");
        Ok(true)
    }

    async fn next_fire(&self, hook_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let hooks = self.hooks.lock().await;
        let Some(jobs) = hooks.get(hook_id) else {
            return Ok(None);
        };

        let mut sched = self.sched.clone();
        let Some(recurring) = jobs.recurring else {
            let tick = sched.next_tick_for_job(jobs.kickoff).await.ok().flatten();
            return Ok(Some(tick.unwrap_or(jobs.start_at)));
        };
        let tick = sched.next_tick_for_job(recurring).await?;
        let fallback = chrono::Duration::from_std(jobs.every)
            .map(|every| jobs.start_at + every)
            .unwrap_or(jobs.start_at);
        Ok(Some(tick.unwrap_or(fallback)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualTrigger {
    pub every: Duration,
    pub next_fire: DateTime<Utc>,
}

/// Trigger registry driven by explicit calls to [`ManualTriggerScheduler::fire_due`].
pub struct ManualTriggerScheduler {
    handler: Arc<dyn TriggerHandler>,
    triggers: Mutex<BTreeMap<String, ManualTrigger>>,
    installs: AtomicUsize,
    cancels: AtomicUsize,
}

impl ManualTriggerScheduler {
    pub fn new(handler: Arc<dyn TriggerHandler>) -> Self {
        Self {
            handler,
            triggers: Mutex::new(BTreeMap::new()),
            installs: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub async fn pending(&self) -> BTreeMap<String, ManualTrigger> {
        self.triggers.lock().await.clone()
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Hooks due at `now`; each is moved to its next fire time after `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut triggers = self.triggers.lock().await;
        let mut due = Vec::new();
        for (hook, trigger) in triggers.iter_mut() {
            if trigger.next_fire > now {
                continue;
            }
            let step = chrono::Duration::from_std(trigger.every)
                .unwrap_or(chrono::Duration::seconds(1));
            let step = step.max(chrono::Duration::seconds(1));
            while trigger.next_fire <= now {
                trigger.next_fire += step;
            }
            due.push(hook.clone());
        }
        due
    }

    /// Fire every due hook through the handler; returns how many fired.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let due = self.due(now).await;
        for hook in &due {
            self.handler.fire(hook).await;
        }
        due.len()
    }
}

#[async_trait]
impl TriggerScheduler for ManualTriggerScheduler {
    async fn schedule_recurring(
        &self,
        hook_id: &str,
        every: Duration,
        start_at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.triggers.lock().await.insert(
            hook_id.to_string(),
            ManualTrigger {
                every,
                next_fire: start_at,
            },
        );
        Ok(())
    }

    async fn cancel(&self, hook_id: &str) -> Result<bool, SchedulerError> {
        let removed = self.triggers.lock().await.remove(hook_id).is_some();
        if removed {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn next_fire(&self, hook_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self.triggers.lock().await.get(hook_id).map(|t| t.next_fire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TriggerHandler for Recorder {
        async fn fire(&self, hook_id: &str) {
            self.fired.lock().await.push(hook_id.to_string());
        }
    }

    #[tokio::test]
    async fn manual_triggers_fire_on_cadence() {
        let recorder = Arc::new(Recorder::default());
        let triggers = ManualTriggerScheduler::new(recorder.clone());
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("ts");

        triggers
            .schedule_recurring("hook_a", Duration::from_secs(3_600), start)
            .await
            .expect("schedule");

        assert_eq!(triggers.fire_due(start).await, 1);
        assert_eq!(triggers.fire_due(start + chrono::Duration::minutes(30)).await, 0);
        assert_eq!(triggers.fire_due(start + chrono::Duration::hours(1)).await, 1);
        assert_eq!(
            triggers.next_fire("hook_a").await.expect("next"),
            Some(start + chrono::Duration::hours(2))
        );
        assert_eq!(recorder.fired.lock().await.len(), 2);

        assert!(triggers.cancel("hook_a").await.expect("cancel"));
        assert!(!triggers.cancel("hook_a").await.expect("cancel again"));
        assert_eq!(triggers.cancel_count(), 1);
        assert_eq!(triggers.install_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_triggers_register_and_cancel_jobs() {
        let sched = JobScheduler::new().await.expect("scheduler");
        let triggers = CronTriggerScheduler::new(sched, Arc::new(Recorder::default()));
        let start = Utc::now() + chrono::Duration::hours(1);

        triggers
            .schedule_recurring("hook_b", Duration::from_secs(86_400), start)
            .await
            .expect("schedule");
        triggers
            .schedule_recurring("hook_b", Duration::from_secs(86_400), start)
            .await
            .expect("replace");
        assert!(triggers.next_fire("hook_b").await.expect("next").is_some());
        assert_eq!(triggers.hooks.lock().await.len(), 1);
        assert!(triggers.hooks.lock().await["hook_b"].recurring.is_none());

        assert!(triggers.cancel("hook_b").await.expect("cancel"));
        assert_eq!(triggers.next_fire("hook_b").await.expect("next"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recurring_job_starts_with_the_kickoff() {
        let mut sched = JobScheduler::new().await.expect("scheduler");
        sched.start().await.expect("start");
        let recorder = Arc::new(Recorder::default());
        let triggers = CronTriggerScheduler::new(sched.clone(), recorder.clone());

        triggers
            .schedule_recurring("hook_c", Duration::from_secs(3_600), Utc::now())
            .await
            .expect("schedule");

        for _ in 0..50 {
            if !recorder.fired.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(*recorder.fired.lock().await, vec!["hook_c".to_string()]);
        assert!(triggers.hooks.lock().await["hook_c"].recurring.is_some());

        let next = triggers.next_fire("hook_c").await.expect("next").expect("scheduled");
        assert!(next > Utc::now() + chrono::Duration::minutes(50));

        assert!(triggers.cancel("hook_c").await.expect("cancel"));
        sched.shutdown().await.expect("shutdown");
    }
}
