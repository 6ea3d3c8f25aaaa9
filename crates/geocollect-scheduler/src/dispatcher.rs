use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use geocollect_core::JobId;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::pipeline::RunPipeline;
use crate::queue::RunQueue;
use crate::types::RunOutcome;

type JobLocks = Arc<StdMutex<HashMap<JobId, Arc<Mutex<()>>>>>;

/// Drains the run queue onto a bounded pool of pipeline tasks.
///
/// At most `max_workers` pipelines execute at once, and two runs of the same
/// job never overlap: the second waits for the first to finish.
pub struct Dispatcher {
    queue: Arc<RunQueue>,
    pipeline: Arc<RunPipeline>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    job_locks: JobLocks,
    grace: Duration,
    outcomes: Option<mpsc::UnboundedSender<RunOutcome>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RunQueue>,
        pipeline: Arc<RunPipeline>,
        max_workers: usize,
        grace: Duration,
    ) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            queue,
            pipeline,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            job_locks: Arc::new(StdMutex::new(HashMap::new())),
            grace,
            outcomes: None,
        }
    }

    /// Send every finished run's outcome to `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<RunOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`, then gives in-flight
    /// pipelines the grace period before aborting them.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(max_workers = self.max_workers, "dispatcher started");
        let mut tasks = JoinSet::new();

        loop {
            for job_id in self.queue.dequeue_all() {
                self.spawn(&mut tasks, job_id);
            }

            tokio::select! {
                _ = self.queue.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Runs still waiting for a worker slot never start.
        self.workers.close();
        let in_flight = tasks.len();
        info!(in_flight, "dispatcher shutting down");

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = self.grace.as_secs(),
                "grace period elapsed, abandoning in-flight runs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("dispatcher stopped");
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, job_id: JobId) {
        let pipeline = Arc::clone(&self.pipeline);
        let workers = Arc::clone(&self.workers);
        let locks = Arc::clone(&self.job_locks);
        let outcomes = self.outcomes.clone();
        let job_lock = job_lock(&locks, job_id);

        tasks.spawn(async move {
            let guard = job_lock.lock().await;
            let Ok(_permit) = workers.acquire_owned().await else {
                debug!(%job_id, "dispatcher closed before run started");
                return;
            };
            debug!(%job_id, "run started");
            let outcome = pipeline.run(job_id).await;
            drop(guard);
            drop(job_lock);
            release_job_lock(&locks, job_id);

            if let Some(tx) = outcomes {
                let _ = tx.send(outcome);
            }
        });
    }
}

fn job_lock(locks: &JobLocks, job_id: JobId) -> Arc<Mutex<()>> {
    let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(map.entry(job_id).or_default())
}

/// Forget the lock once no queued or running task of the job holds it.
fn release_job_lock(locks: &JobLocks, job_id: JobId) {
    let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
    if map.get(&job_id).is_some_and(|l| Arc::strong_count(l) == 1) {
        map.remove(&job_id);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("pipeline task panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Collaborators, DataAccessor, DataStorager};
    use crate::registry::Registry;
    use async_trait::async_trait;
    use chrono::Utc;
    use geocollect_core::{
        DataProvider, DataProviderId, DataSeries, DataSeriesId, DataSet, DataSetId,
        FetchedDataSet, Filter, InstanceId, Job, Record, Schedule,
    };
    use geocollect_runlog::{RunLogger, SqliteRunLogger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps, then returns one fresh record, tracking peak concurrency.
    #[derive(Default)]
    struct SlowAccessor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl DataAccessor for SlowAccessor {
        async fn fetch(
            &self,
            _provider: &DataProvider,
            series: &DataSeries,
            _filter: &Filter,
        ) -> geocollect_core::Result<Vec<FetchedDataSet>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![FetchedDataSet::from_records(
                series.datasets[0].clone(),
                vec![Record {
                    timestamp: Utc::now(),
                    geometry: None,
                    attributes: serde_json::Value::Null,
                }],
            )])
        }
    }

    struct Sink;

    #[async_trait]
    impl DataStorager for Sink {
        async fn store(
            &self,
            _provider: &DataProvider,
            _series: &DataSeries,
            _dataset: &DataSet,
            records: &[Record],
        ) -> geocollect_core::Result<usize> {
            Ok(records.len())
        }
    }

    fn setup(
        max_workers: usize,
        jobs: &[u64],
    ) -> (Arc<RunQueue>, Dispatcher, Arc<SlowAccessor>, Arc<SqliteRunLogger>) {
        let registry = Arc::new(Registry::new());
        registry.add_provider(DataProvider {
            id: DataProviderId(1),
            name: "p".into(),
            kind: "slow".into(),
            uri: "mem://".into(),
            active: true,
        });
        for (series, ds) in [(10, 100), (20, 200)] {
            registry.add_series(DataSeries {
                id: DataSeriesId(series),
                name: format!("s{series}"),
                provider_id: DataProviderId(1),
                format: "sink".into(),
                datasets: vec![DataSet {
                    id: DataSetId(ds),
                    series_id: DataSeriesId(series),
                    active: true,
                    format: HashMap::new(),
                }],
            });
        }
        for id in jobs {
            registry.add_job(Job {
                id: JobId(*id),
                name: format!("job-{id}"),
                instance_id: InstanceId(1),
                active: true,
                input_series: DataSeriesId(10),
                output_series: DataSeriesId(20),
                filter: Filter::default(),
                intersection: None,
                input_output_map: HashMap::from([(DataSetId(100), DataSetId(200))]),
                schedule: Schedule::Frequency {
                    frequency: 1,
                    unit: "hour".into(),
                },
            });
        }

        let accessor = Arc::new(SlowAccessor::default());
        let logger = Arc::new(SqliteRunLogger::in_memory().unwrap());
        let pipeline = Arc::new(RunPipeline::new(
            Arc::clone(&registry),
            logger.clone(),
            Collaborators::new()
                .with_accessor("slow", accessor.clone())
                .with_storager("sink", Arc::new(Sink)),
        ));
        let queue = Arc::new(RunQueue::new(InstanceId(1), registry));
        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            pipeline,
            max_workers,
            Duration::from_secs(30),
        );
        (queue, dispatcher, accessor, logger)
    }

    #[tokio::test(start_paused = true)]
    async fn runs_all_queued_jobs_within_worker_bound() {
        let (queue, dispatcher, accessor, logger) = setup(2, &[1, 2, 3]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.with_outcomes(tx).run(stop_rx));

        for id in [1, 2, 3] {
            queue.enqueue(JobId(id));
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        assert_eq!(accessor.peak.load(Ordering::SeqCst), 2);
        for id in [1, 2, 3] {
            assert_eq!(logger.runs(JobId(id), 10).unwrap().len(), 1);
        }

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_job_runs_never_overlap() {
        let (queue, dispatcher, accessor, logger) = setup(4, &[1]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.with_outcomes(tx).run(stop_rx));

        queue.enqueue(JobId(1));
        queue.enqueue(JobId(1));
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(accessor.peak.load(Ordering::SeqCst), 1);
        assert_eq!(logger.runs(JobId(1), 10).unwrap().len(), 2);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_in_flight_run_finish() {
        let (queue, dispatcher, _accessor, logger) = setup(1, &[1]);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(stop_rx));

        queue.enqueue(JobId(1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        let runs = logger.runs(JobId(1), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].status.is_terminal());
    }
}
