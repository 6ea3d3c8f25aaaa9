use chrono::{DateTime, Utc};
use geocollect_core::{DataSetId, Job, JobId, RunId};
use geocollect_runlog::RunStatus;
use serde::Serialize;

/// Configuration change pushed by the registry to the service.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    JobAdded(Job),
    JobUpdated(Job),
    JobRemoved(JobId),
}

/// Stage a run has reached. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Queued,
    Preparing,
    Fetching,
    Intersecting,
    Storing,
    Done,
    Error,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Queued => "queued",
            PipelineState::Preparing => "preparing",
            PipelineState::Fetching => "fetching",
            PipelineState::Intersecting => "intersecting",
            PipelineState::Storing => "storing",
            PipelineState::Done => "done",
            PipelineState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One dataset skipped during an otherwise running pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSetFailure {
    pub dataset_id: DataSetId,
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for DataSetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset {}: {}", self.dataset_id, self.message)
    }
}

/// Summary returned by a finished pipeline.
///
/// `run_id` is `None` when the run never got past `Preparing` and so left no
/// run record. `status` mirrors what was written to the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub state: PipelineState,
    pub status: Option<RunStatus>,
    pub datasets_stored: usize,
    pub records_stored: usize,
    pub failures: Vec<DataSetFailure>,
    /// Latest input timestamp observed by the fetch.
    pub max_timestamp: Option<DateTime<Utc>>,
    /// Timestamp written with a successful run. Equals `max_timestamp` unless
    /// a dataset failed, in which case it stops short of that dataset's data.
    pub data_timestamp: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl RunOutcome {
    pub(crate) fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            run_id: None,
            state: PipelineState::Queued,
            status: None,
            datasets_stored: 0,
            records_stored: 0,
            failures: Vec::new(),
            max_timestamp: None,
            data_timestamp: None,
            message: None,
        }
    }
}

/// Result of arming a job's timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmOutcome {
    /// A timer is running; the first tick is due at `first_fire`.
    Armed { first_fire: DateTime<Utc> },
    /// The job is already armed with an identical schedule.
    Unchanged,
    /// The job is not armed here (foreign instance, inactive).
    Skipped(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(PipelineState::Done.is_terminal());
        assert!(PipelineState::Error.is_terminal());
        assert!(!PipelineState::Storing.is_terminal());
        assert_eq!(PipelineState::Intersecting.to_string(), "intersecting");
    }

    #[test]
    fn failure_display_names_dataset() {
        let f = DataSetFailure {
            dataset_id: DataSetId(4),
            code: "STORAGE_ERROR",
            message: "disk full".into(),
        };
        assert_eq!(f.to_string(), "dataset 4: disk full");
    }
}
