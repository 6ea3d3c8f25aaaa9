//! End-to-end behaviour of the collector service with in-memory collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use geocollect_core::config::CollectorConfig;
use geocollect_core::{
    CollectorError, DataProvider, DataProviderId, DataSeries, DataSeriesId, DataSet, DataSetId,
    FetchedDataSet, Filter, InstanceId, IntersectionLayer, IntersectionPolicy, Job, JobId, Record,
    Schedule,
};
use geocollect_runlog::{RunLogger, RunStatus, SqliteRunLogger};
use geocollect_scheduler::{
    Collaborators, CollectorService, DataAccessor, DataStorager, IntersectionOperation,
    PipelineState, Registry, RunOutcome,
};
use tokio::sync::{mpsc, watch};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn dataset(id: u64, series: u64) -> DataSet {
    DataSet {
        id: DataSetId(id),
        series_id: DataSeriesId(series),
        active: true,
        format: HashMap::new(),
    }
}

/// Upstream table: fixed records per input dataset, filtered like a database
/// would filter them.
struct Upstream {
    data: Vec<(DataSet, Vec<i64>)>,
    delay: Duration,
    fetches: AtomicUsize,
}

#[async_trait]
impl DataAccessor for Upstream {
    async fn fetch(
        &self,
        _provider: &DataProvider,
        _series: &DataSeries,
        filter: &Filter,
    ) -> geocollect_core::Result<Vec<FetchedDataSet>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self
            .data
            .iter()
            .map(|(ds, stamps)| {
                let records = stamps
                    .iter()
                    .map(|s| Record {
                        timestamp: ts(*s),
                        geometry: Some("POINT(-45.9 -23.2)".into()),
                        attributes: serde_json::json!({ "satellite": "AQUA_M-T" }),
                    })
                    .filter(|r| filter.accepts(r.timestamp))
                    .collect();
                FetchedDataSet::from_records(ds.clone(), records)
            })
            .collect())
    }
}

#[derive(Default)]
struct Store {
    written: Mutex<Vec<(DataSetId, usize)>>,
}

impl Store {
    fn total(&self) -> usize {
        self.written.lock().unwrap().iter().map(|(_, n)| n).sum()
    }
}

#[async_trait]
impl DataStorager for Store {
    async fn store(
        &self,
        _provider: &DataProvider,
        _series: &DataSeries,
        dataset: &DataSet,
        records: &[Record],
    ) -> geocollect_core::Result<usize> {
        self.written.lock().unwrap().push((dataset.id, records.len()));
        Ok(records.len())
    }
}

/// Rejects one dataset's geometry.
struct Clip {
    reject: DataSetId,
}

#[async_trait]
impl IntersectionOperation for Clip {
    async fn intersect(
        &self,
        _policy: &IntersectionPolicy,
        _layers: &[DataSeries],
        dataset: &DataSet,
        records: Vec<Record>,
    ) -> geocollect_core::Result<Vec<Record>> {
        if dataset.id == self.reject {
            return Err(CollectorError::Processing("self-intersecting polygon".into()));
        }
        Ok(records)
    }
}

struct Harness {
    registry: Arc<Registry>,
    logger: Arc<SqliteRunLogger>,
    store: Arc<Store>,
    upstream: Arc<Upstream>,
    outcomes: mpsc::UnboundedReceiver<RunOutcome>,
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn next_outcome(&mut self, within: Duration) -> Option<RunOutcome> {
        tokio::time::timeout(within, self.outcomes.recv())
            .await
            .ok()
            .flatten()
    }

    async fn shutdown(self) {
        self.stop.send(true).unwrap();
        self.handle.await.unwrap();
    }
}

fn job(id: u64, instance: u32, schedule: Schedule) -> Job {
    Job {
        id: JobId(id),
        name: format!("fires-{id}"),
        instance_id: InstanceId(instance),
        active: true,
        input_series: DataSeriesId(10),
        output_series: DataSeriesId(20),
        filter: Filter::default(),
        intersection: None,
        input_output_map: HashMap::from([
            (DataSetId(100), DataSetId(200)),
            (DataSetId(101), DataSetId(201)),
        ]),
        schedule,
    }
}

fn every(frequency: i64, unit: &str) -> Schedule {
    Schedule::Frequency {
        frequency,
        unit: unit.into(),
    }
}

/// Start a service for instance 1 with `jobs` registered.
fn start(jobs: Vec<Job>, upstream: Upstream, intersection: Option<Clip>) -> Harness {
    let (registry, events) = Registry::channel();
    registry.add_provider(DataProvider {
        id: DataProviderId(1),
        name: "inpe".into(),
        kind: "memory".into(),
        uri: "mem://fires".into(),
        active: true,
    });
    registry.add_series(DataSeries {
        id: DataSeriesId(10),
        name: "fires-in".into(),
        provider_id: DataProviderId(1),
        format: "memory".into(),
        datasets: vec![dataset(100, 10), dataset(101, 10)],
    });
    registry.add_series(DataSeries {
        id: DataSeriesId(20),
        name: "fires-out".into(),
        provider_id: DataProviderId(1),
        format: "memory-store".into(),
        datasets: vec![dataset(200, 20), dataset(201, 20)],
    });
    registry.add_series(DataSeries {
        id: DataSeriesId(30),
        name: "states".into(),
        provider_id: DataProviderId(1),
        format: "memory".into(),
        datasets: vec![],
    });
    for j in jobs {
        registry.add_job(j);
    }
    let registry = Arc::new(registry);

    let logger = Arc::new(SqliteRunLogger::in_memory().unwrap());
    let store = Arc::new(Store::default());
    let upstream = Arc::new(upstream);
    let mut collaborators = Collaborators::new()
        .with_accessor("memory", upstream.clone())
        .with_storager("memory-store", store.clone());
    if let Some(clip) = intersection {
        collaborators = collaborators.with_intersection(Arc::new(clip));
    }

    let config = CollectorConfig::default();
    let (tx, outcomes) = mpsc::unbounded_channel();
    let service = CollectorService::new(
        &config,
        Arc::clone(&registry),
        logger.clone() as Arc<dyn RunLogger>,
        collaborators,
    )
    .with_outcomes(tx);
    let (stop, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(service.run(events, stop_rx));

    Harness {
        registry,
        logger,
        store,
        upstream,
        outcomes,
        stop,
        handle,
    }
}

fn upstream(data: Vec<(DataSet, Vec<i64>)>) -> Upstream {
    Upstream {
        data,
        delay: Duration::ZERO,
        fetches: AtomicUsize::new(0),
    }
}

#[tokio::test(start_paused = true)]
async fn first_run_collects_and_second_run_finds_nothing_new() {
    let mut h = start(
        vec![job(1, 1, every(2, "minutes"))],
        upstream(vec![(dataset(100, 10), vec![40, 70, 100])]),
        None,
    );

    // No prior run: fires immediately.
    let first = h.next_outcome(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.job_id, JobId(1));
    assert_eq!(first.status, Some(RunStatus::Success));
    assert_eq!(first.records_stored, 3);
    assert_eq!(h.logger.last_timestamp(JobId(1)).unwrap(), Some(ts(100)));

    // Nothing in between.
    assert!(h.next_outcome(Duration::from_secs(110)).await.is_none());

    let second = h.next_outcome(Duration::from_secs(20)).await.unwrap();
    assert_eq!(second.status, Some(RunStatus::NoData));
    assert_eq!(second.state, PipelineState::Done);
    assert_eq!(h.logger.last_timestamp(JobId(1)).unwrap(), Some(ts(100)));
    assert_eq!(h.store.total(), 3);

    let history = h.logger.runs(JobId(1), 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, RunStatus::NoData);
    assert_eq!(history[1].data_timestamp, Some(ts(100)));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn foreign_job_never_runs_here() {
    let mut h = start(
        vec![job(7, 2, every(1, "minute"))],
        upstream(vec![(dataset(100, 10), vec![1])]),
        None,
    );

    assert!(h.next_outcome(Duration::from_secs(600)).await.is_none());
    assert_eq!(h.upstream.fetches.load(Ordering::SeqCst), 0);
    assert!(h.logger.runs(JobId(7), 10).unwrap().is_empty());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_dataset_does_not_block_siblings() {
    let mut j = job(1, 1, every(1, "hour"));
    j.intersection = Some(IntersectionPolicy {
        layers: vec![IntersectionLayer {
            series_id: DataSeriesId(30),
            attributes: vec!["uf".into()],
        }],
    });
    let mut h = start(
        vec![j],
        upstream(vec![(dataset(100, 10), vec![10, 20]), (dataset(101, 10), vec![30])]),
        Some(Clip {
            reject: DataSetId(100),
        }),
    );

    let outcome = h.next_outcome(Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome.status, Some(RunStatus::Success));
    assert_eq!(outcome.datasets_stored, 1);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].dataset_id, DataSetId(100));
    assert_eq!(*h.store.written.lock().unwrap(), vec![(DataSetId(201), 1)]);

    let record = &h.logger.runs(JobId(1), 1).unwrap()[0];
    assert_eq!(record.status, RunStatus::Success);
    assert!(record
        .message
        .as_deref()
        .is_some_and(|m| m.contains("self-intersecting polygon")));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_job_finishes_in_flight_run_then_stops() {
    let mut slow = upstream(vec![(dataset(100, 10), vec![5])]);
    slow.delay = Duration::from_secs(30);
    let mut h = start(vec![job(1, 1, every(1, "minute"))], slow, None);

    // Let the first run reach the accessor, then remove the job.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.upstream.fetches.load(Ordering::SeqCst), 1);
    h.registry.remove_job(JobId(1)).unwrap();

    let finished = h.next_outcome(Duration::from_secs(60)).await.unwrap();
    assert_eq!(finished.status, Some(RunStatus::Success));
    assert_eq!(h.logger.runs(JobId(1), 10).unwrap().len(), 1);

    assert!(h.next_outcome(Duration::from_secs(600)).await.is_none());
    assert_eq!(h.upstream.fetches.load(Ordering::SeqCst), 1);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_schedule_keeps_job_registered_but_idle() {
    let mut h = start(
        vec![job(1, 1, every(0, "minutes")), job(2, 1, every(3, "fortnights"))],
        upstream(vec![(dataset(100, 10), vec![1])]),
        None,
    );

    assert!(h.next_outcome(Duration::from_secs(3600)).await.is_none());
    assert_eq!(h.upstream.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.registry.job_count(), 2);

    // Fixing the schedule arms it.
    let mut fixed = job(1, 1, every(5, "minutes"));
    fixed.name = "fires-fixed".into();
    h.registry.update_job(fixed).unwrap();
    let outcome = h.next_outcome(Duration::from_secs(1)).await.unwrap();
    assert_eq!(outcome.job_id, JobId(1));

    h.shutdown().await;
}
