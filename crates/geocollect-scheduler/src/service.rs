use std::sync::Arc;
use std::time::Duration;

use geocollect_core::config::CollectorConfig;
use geocollect_core::{InstanceId, Job, JobId};
use geocollect_runlog::{RunLogger, SqliteRunLogger};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::access::Collaborators;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::pipeline::RunPipeline;
use crate::queue::RunQueue;
use crate::registry::Registry;
use crate::timers::TimerSet;
use crate::types::{ArmOutcome, ConfigEvent, RunOutcome};

/// Wires registry, timers, queue, dispatcher and pipeline together for one
/// service instance.
pub struct CollectorService {
    instance_id: InstanceId,
    max_workers: usize,
    grace: Duration,
    registry: Arc<Registry>,
    queue: Arc<RunQueue>,
    timers: Arc<TimerSet>,
    pipeline: Arc<RunPipeline>,
    outcomes: Option<mpsc::UnboundedSender<RunOutcome>>,
}

impl CollectorService {
    pub fn new(
        config: &CollectorConfig,
        registry: Arc<Registry>,
        logger: Arc<dyn RunLogger>,
        collaborators: Collaborators,
    ) -> Self {
        let instance_id = config.instance_id;
        let queue = Arc::new(RunQueue::new(instance_id, Arc::clone(&registry)));
        let timers = Arc::new(TimerSet::new(
            instance_id,
            Arc::clone(&registry),
            Arc::clone(&logger),
            Arc::clone(&queue),
        ));
        let pipeline = Arc::new(RunPipeline::new(
            Arc::clone(&registry),
            logger,
            collaborators,
        ));
        Self {
            instance_id,
            max_workers: config.dispatcher.max_workers,
            grace: Duration::from_secs(config.dispatcher.shutdown_grace_secs),
            registry,
            queue,
            timers,
            pipeline,
            outcomes: None,
        }
    }

    /// Build a service from configuration: validate it, open the SQLite run
    /// log at `database.path`, recover interrupted runs and seed the registry
    /// from the catalog.
    ///
    /// The returned receiver carries the registry's configuration events and
    /// is meant to be handed to [`CollectorService::run`].
    pub fn from_config(
        config: &CollectorConfig,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConfigEvent>)> {
        config.validate()?;
        let logger = SqliteRunLogger::open(&config.database.path)?;
        logger.recover_interrupted()?;

        let (registry, events) = Registry::channel();
        registry.load_catalog(config.catalog.clone());
        let service = Self::new(config, Arc::new(registry), Arc::new(logger), collaborators);
        Ok((service, events))
    }

    /// Report every finished run's outcome on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<RunOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    pub fn timers(&self) -> &Arc<TimerSet> {
        &self.timers
    }

    /// Queue a run outside the job's schedule.
    pub fn trigger(&self, job_id: JobId) -> bool {
        self.queue.enqueue(job_id)
    }

    /// React to one configuration event. Never fails: problems are logged and
    /// the job stays registered.
    pub fn handle_event(&self, event: ConfigEvent) {
        match event {
            ConfigEvent::JobAdded(job) | ConfigEvent::JobUpdated(job) => self.arm(&job),
            ConfigEvent::JobRemoved(job_id) => {
                self.timers.disarm(job_id);
                let purged = self.queue.purge(job_id);
                if purged > 0 {
                    info!(%job_id, purged, "queued runs of removed job dropped");
                }
            }
        }
    }

    fn arm(&self, job: &Job) {
        match self.timers.arm(job) {
            Ok(ArmOutcome::Skipped(reason)) => {
                self.queue.purge(job.id);
                info!(job_id = %job.id, %reason, "job not scheduled on this instance");
            }
            Ok(_) => {}
            Err(e) => {
                error!(job_id = %job.id, code = e.code(), "job could not be scheduled: {e}");
            }
        }
    }

    /// Run until `shutdown` broadcasts `true`.
    ///
    /// Arms every registered job, starts the dispatcher and applies
    /// configuration events in delivery order. On shutdown the timers stop,
    /// the queue closes and in-flight runs get the configured grace period.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ConfigEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(instance_id = %self.instance_id, jobs = self.registry.job_count(), "collector service started");
        for job in self.registry.jobs() {
            self.arm(&job);
        }

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.pipeline),
            self.max_workers,
            self.grace,
        );
        if let Some(tx) = &self.outcomes {
            dispatcher = dispatcher.with_outcomes(tx.clone());
        }
        let dispatcher = tokio::spawn(dispatcher.run(shutdown.clone()));

        let mut events_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("configuration event channel closed");
                        events_open = false;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("collector service shutting down");
        self.timers.disarm_all();
        self.queue.close();
        if let Err(e) = dispatcher.await {
            error!("dispatcher task failed: {e}");
        }
        info!("collector service stopped");
    }
}
