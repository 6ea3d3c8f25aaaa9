use chrono::{DateTime, Utc};
use geocollect_core::{JobId, RunId};
use serde::{Deserialize, Serialize};

/// Status of a run record. Everything except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Started, not yet finalized (or interrupted by a crash).
    Running,
    /// Data was fetched and stored. May carry partial-failure detail.
    Success,
    /// Nothing new matched the filter. Not a failure.
    NoData,
    /// The run failed; the data timestamp did not advance.
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::NoData => "no_data",
            RunStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "no_data" => Ok(RunStatus::NoData),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One pipeline execution as persisted in `collector_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub job_id: JobId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Latest timestamp observed in the input during this run.
    pub data_timestamp: Option<DateTime<Utc>>,
    /// Error description, or per-dataset detail for a partial success.
    pub message: Option<String>,
}
