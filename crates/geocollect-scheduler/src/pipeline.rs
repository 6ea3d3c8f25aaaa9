use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use geocollect_core::{
    CollectorError, DataSet, DataSetId, ErrorScope, FetchedDataSet, IntersectionPolicy, JobId,
    Record, RunId,
};
use geocollect_runlog::{RunLogError, RunLogger, RunStatus};
use tracing::{debug, error, info, warn};

use crate::access::{Collaborators, DataStorager, IntersectionOperation};
use crate::registry::{PreparedRun, Registry};
use crate::types::{DataSetFailure, PipelineState, RunOutcome};

/// Executes one run of a job:
/// `Preparing → Fetching → (Intersecting) → Storing → Done`, or `Error`.
///
/// [`RunPipeline::run`] never fails and never panics: every failure is caught
/// here, classified and written to the run log.
pub struct RunPipeline {
    registry: Arc<Registry>,
    logger: Arc<dyn RunLogger>,
    collaborators: Collaborators,
}

impl RunPipeline {
    pub fn new(
        registry: Arc<Registry>,
        logger: Arc<dyn RunLogger>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            registry,
            logger,
            collaborators,
        }
    }

    pub async fn run(&self, job_id: JobId) -> RunOutcome {
        let mut outcome = RunOutcome::new(job_id);
        let result = AssertUnwindSafe(self.execute(job_id, &mut outcome))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail(&mut outcome, e),
            Err(payload) => self.fail(&mut outcome, CollectorError::Unknown(panic_message(payload))),
        }
        outcome
    }

    async fn execute(&self, job_id: JobId, out: &mut RunOutcome) -> geocollect_core::Result<()> {
        out.state = PipelineState::Preparing;
        let prepared = self.registry.prepare(job_id)?;
        let accessor = self.collaborators.accessor(&prepared.input_provider.kind)?;
        let storager = self.collaborators.storager(&prepared.output_series.format)?;
        let intersection = match &prepared.job.intersection {
            Some(policy) if !policy.layers.is_empty() => {
                Some((policy, self.collaborators.intersection()?))
            }
            _ => None,
        };

        out.state = PipelineState::Fetching;
        let run_id = self.logger.start(job_id).map_err(run_log)?;
        out.run_id = Some(run_id.clone());

        let last = self.logger.last_timestamp(job_id).map_err(run_log)?;
        let filter = prepared.job.filter.with_last_timestamp(last);
        debug!(%job_id, %run_id, discard_before = ?filter.discard_before, "fetching");

        let fetched = match accessor
            .fetch(&prepared.input_provider, &prepared.input_series, &filter)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) if e.is_no_data() => {
                debug!(%job_id, "accessor reported no data: {e}");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        out.max_timestamp = fetched.iter().filter_map(|f| f.max_timestamp).max();

        if fetched.iter().all(FetchedDataSet::is_empty) {
            self.logger.no_data(&run_id).map_err(run_log)?;
            out.state = PipelineState::Done;
            out.status = Some(RunStatus::NoData);
            info!(%job_id, %run_id, "run finished: no new data");
            return Ok(());
        }

        // Earliest record of any dataset that was not stored; the recorded
        // bound must stay below it so the next run fetches it again.
        let mut unstored_from: Option<DateTime<Utc>> = None;
        for item in fetched.into_iter().filter(|f| !f.is_empty()) {
            let dataset_id = item.dataset.id;
            let earliest = item.records.iter().map(|r| r.timestamp).min();
            let result = match output_dataset(&prepared, dataset_id) {
                Ok(output) => {
                    self.process_dataset(
                        &prepared,
                        intersection.as_ref(),
                        storager.as_ref(),
                        output,
                        item,
                        &mut out.state,
                    )
                    .await
                }
                // A missing mapping only affects this dataset.
                Err(e) => {
                    skip_dataset(out, &run_id, &mut unstored_from, dataset_id, earliest, e);
                    continue;
                }
            };
            match result {
                Ok(stored) => {
                    out.datasets_stored += 1;
                    out.records_stored += stored;
                }
                Err(e) => match e.scope() {
                    ErrorScope::None => {
                        debug!(%job_id, %run_id, %dataset_id, "nothing left to store: {e}");
                        out.datasets_stored += 1;
                    }
                    ErrorScope::DataSet => {
                        skip_dataset(out, &run_id, &mut unstored_from, dataset_id, earliest, e);
                    }
                    ErrorScope::Run | ErrorScope::Job => return Err(e),
                },
            }
        }

        if out.datasets_stored == 0 {
            let message = failure_summary(&out.failures);
            self.logger.error(&run_id, &message).map_err(run_log)?;
            out.state = PipelineState::Error;
            out.status = Some(RunStatus::Error);
            error!(%job_id, %run_id, "run failed: {message}");
            out.message = Some(message);
            return Ok(());
        }

        let observed = out.max_timestamp;
        out.data_timestamp = match unstored_from {
            Some(t) => t
                .checked_sub_signed(Duration::nanoseconds(1))
                .map(|cap| observed.map_or(cap, |max| max.min(cap))),
            None => observed,
        };
        let detail = (!out.failures.is_empty()).then(|| failure_summary(&out.failures));
        self.logger
            .done(&run_id, out.data_timestamp, detail.as_deref())
            .map_err(run_log)?;
        out.state = PipelineState::Done;
        out.status = Some(RunStatus::Success);
        out.message = detail;
        info!(
            %job_id,
            %run_id,
            datasets = out.datasets_stored,
            records = out.records_stored,
            failed = out.failures.len(),
            "run finished"
        );
        Ok(())
    }

    /// Intersect (when configured) and store one fetched dataset.
    async fn process_dataset(
        &self,
        prepared: &PreparedRun,
        intersection: Option<&(&IntersectionPolicy, Arc<dyn IntersectionOperation>)>,
        storager: &dyn DataStorager,
        output: &DataSet,
        fetched: FetchedDataSet,
        state: &mut PipelineState,
    ) -> geocollect_core::Result<usize> {
        let FetchedDataSet {
            dataset, records, ..
        } = fetched;

        let records: Vec<Record> = match intersection {
            Some((policy, op)) => {
                *state = PipelineState::Intersecting;
                op.intersect(policy, &prepared.intersection_series, &dataset, records)
                    .await?
            }
            None => records,
        };

        *state = PipelineState::Storing;
        storager
            .store(&prepared.output_provider, &prepared.output_series, output, &records)
            .await
    }

    fn fail(&self, out: &mut RunOutcome, e: CollectorError) {
        let message = e.to_string();
        match &out.run_id {
            Some(run_id) if out.status.is_none() => {
                error!(job_id = %out.job_id, %run_id, state = %out.state, code = e.code(), "run failed: {message}");
                if let Err(log_err) = self.logger.error(run_id, &message) {
                    error!(job_id = %out.job_id, %run_id, "could not record run failure: {log_err}");
                } else {
                    out.status = Some(RunStatus::Error);
                }
            }
            Some(run_id) => {
                error!(job_id = %out.job_id, %run_id, code = e.code(), "failure after run was recorded: {message}");
            }
            None => {
                error!(job_id = %out.job_id, state = %out.state, code = e.code(), "run not started: {message}");
            }
        }
        out.state = PipelineState::Error;
        out.message = Some(message);
    }
}

/// Output dataset an input dataset is stored into.
fn output_dataset(prepared: &PreparedRun, input: DataSetId) -> geocollect_core::Result<&DataSet> {
    let output_id = prepared.job.output_dataset_for(input).ok_or_else(|| {
        CollectorError::Configuration(format!(
            "no output dataset mapped for input dataset {input}"
        ))
    })?;
    prepared.output_series.dataset(output_id).ok_or_else(|| {
        CollectorError::Configuration(format!(
            "output dataset {output_id} not in series {}",
            prepared.output_series.id
        ))
    })
}

/// Record a dataset that was not stored and lower the resume point to its
/// earliest record.
fn skip_dataset(
    out: &mut RunOutcome,
    run_id: &RunId,
    unstored_from: &mut Option<DateTime<Utc>>,
    dataset_id: DataSetId,
    earliest: Option<DateTime<Utc>>,
    e: CollectorError,
) {
    warn!(job_id = %out.job_id, %run_id, %dataset_id, code = e.code(), "dataset skipped: {e}");
    *unstored_from = match (*unstored_from, earliest) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    out.failures.push(DataSetFailure {
        dataset_id,
        code: e.code(),
        message: e.to_string(),
    });
}

fn run_log(e: RunLogError) -> CollectorError {
    CollectorError::Unknown(format!("run log: {e}"))
}

fn failure_summary(failures: &[DataSetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("pipeline panicked: {detail}")
}
