use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use geocollect_core::{InstanceId, Job, JobId, Schedule};
use geocollect_runlog::RunLogger;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::queue::RunQueue;
use crate::registry::Registry;
use crate::schedule::{compute_next_run, first_fire, period, validate};
use crate::types::ArmOutcome;

struct ArmedTimer {
    schedule: Schedule,
    handle: JoinHandle<()>,
}

/// One tokio task per armed job. Each tick enqueues the job id and never
/// waits for the pipeline.
pub struct TimerSet {
    instance_id: InstanceId,
    registry: Arc<Registry>,
    logger: Arc<dyn RunLogger>,
    queue: Arc<RunQueue>,
    timers: Mutex<HashMap<JobId, ArmedTimer>>,
}

impl TimerSet {
    pub fn new(
        instance_id: InstanceId,
        registry: Arc<Registry>,
        logger: Arc<dyn RunLogger>,
        queue: Arc<RunQueue>,
    ) -> Self {
        Self {
            instance_id,
            registry,
            logger,
            queue,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<JobId, ArmedTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace the timer for `job`.
    ///
    /// Re-arming with the schedule that is already running is a no-op, so
    /// repeated delivery of the same configuration event is harmless. Must be
    /// called from within a tokio runtime.
    pub fn arm(&self, job: &Job) -> Result<ArmOutcome> {
        if job.instance_id != self.instance_id {
            self.disarm(job.id);
            return Ok(ArmOutcome::Skipped(format!(
                "owned by instance {}",
                job.instance_id
            )));
        }
        if !job.active {
            self.disarm(job.id);
            return Ok(ArmOutcome::Skipped("inactive".into()));
        }
        if let Err(e) = validate(&job.schedule) {
            self.disarm(job.id);
            return Err(e);
        }

        if let Some(armed) = self.timers().get(&job.id) {
            if armed.schedule == job.schedule && !armed.handle.is_finished() {
                return Ok(ArmOutcome::Unchanged);
            }
        }

        let last_run = match self.logger.last_run_time(job.id) {
            Ok(t) => t,
            Err(e) => {
                warn!(job_id = %job.id, "could not read last run time, firing now: {e}");
                None
            }
        };
        let first = first_fire(&job.schedule, last_run, Utc::now())?;

        let handle = tokio::spawn(run_timer(
            job.id,
            job.schedule.clone(),
            first,
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
        ));
        let previous = self.timers().insert(
            job.id,
            ArmedTimer {
                schedule: job.schedule.clone(),
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }

        info!(job_id = %job.id, first_fire = %first, "timer armed");
        Ok(ArmOutcome::Armed { first_fire: first })
    }

    /// Cancel the timer for `job_id`. Returns whether one was armed.
    pub fn disarm(&self, job_id: JobId) -> bool {
        match self.timers().remove(&job_id) {
            Some(armed) => {
                armed.handle.abort();
                info!(%job_id, "timer disarmed");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer. Used on shutdown.
    pub fn disarm_all(&self) -> usize {
        let drained: Vec<_> = self.timers().drain().collect();
        for (_, armed) in &drained {
            armed.handle.abort();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "all timers disarmed");
        }
        drained.len()
    }

    pub fn is_armed(&self, job_id: JobId) -> bool {
        self.timers().contains_key(&job_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers().len()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for armed in self.timers().values() {
            armed.handle.abort();
        }
    }
}

async fn run_timer(
    job_id: JobId,
    schedule: Schedule,
    first: DateTime<Utc>,
    registry: Arc<Registry>,
    queue: Arc<RunQueue>,
) {
    let step = match period(&schedule) {
        Ok(step) => step,
        Err(e) => {
            error!(%job_id, "timer stopped: {e}");
            return;
        }
    };

    match step.and_then(|s| s.to_std().ok()) {
        // Fixed period: drive a tokio interval so ticks stay exactly one
        // period apart.
        Some(step) => {
            let mut interval = tokio::time::interval_at(Instant::now() + until(first), step);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                fire(job_id, &registry, &queue);
            }
        }
        // Calendar grid: sleep to each computed wall-clock instant.
        None => {
            let mut next = first;
            loop {
                tokio::time::sleep(until(next)).await;
                fire(job_id, &registry, &queue);
                next = match compute_next_run(&schedule, next.max(Utc::now())) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(%job_id, "timer stopped: {e}");
                        return;
                    }
                };
                debug!(%job_id, next_fire = %next, "timer rescheduled");
            }
        }
    }
}

/// Time left until `at`; zero if already past.
fn until(at: DateTime<Utc>) -> std::time::Duration {
    (at - Utc::now()).to_std().unwrap_or_default()
}

fn fire(job_id: JobId, registry: &Registry, queue: &RunQueue) {
    if !registry.is_active(job_id) {
        debug!(%job_id, "timer fired for inactive or removed job, ignored");
        return;
    }
    debug!(%job_id, "timer fired");
    queue.enqueue(job_id);
}
