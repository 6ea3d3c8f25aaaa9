use geocollect_core::{CollectorError, DataProviderId, DataSeriesId, JobId};
use geocollect_runlog::RunLogError;
use thiserror::Error;

/// Errors raised by scheduling and registry operations.
///
/// Pipeline failures never surface here: they are classified with
/// [`geocollect_core::CollectorError`] and end up in the run log.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule definition is invalid (non-positive frequency, unknown
    /// unit, out-of-range grid field, bad cron expression).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given ID exists in the registry.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("Data series not found: {id}")]
    SeriesNotFound { id: DataSeriesId },

    #[error("Data provider not found: {id}")]
    ProviderNotFound { id: DataProviderId },

    /// Reading or writing the run log failed.
    #[error("Run log error: {0}")]
    RunLog(#[from] RunLogError),

    /// Service configuration could not be loaded or is unusable.
    #[error(transparent)]
    Config(#[from] CollectorError),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule(_) => "CONFIGURATION_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::SeriesNotFound { .. } => "SERIES_NOT_FOUND",
            SchedulerError::ProviderNotFound { .. } => "PROVIDER_NOT_FOUND",
            SchedulerError::RunLog(_) => "RUN_LOG_ERROR",
            SchedulerError::Config(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
