use thiserror::Error;

/// How far a failure reaches: it decides whether sibling datasets, the rest of
/// the run, or the job's scheduling are affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// The job itself is misconfigured; the run (or arm) fails, the job stays registered.
    Job,
    /// Only the current run fails; the next scheduled run retries naturally.
    Run,
    /// Only one dataset is skipped; siblings in the same run continue.
    DataSet,
    /// Not a failure at all.
    None,
}

/// Failure taxonomy shared by the pipeline and its external collaborators.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Invalid schedule, missing output mapping, unknown provider kind, ...
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The input provider could not be reached.
    #[error("Access error: {0}")]
    Access(String),

    /// Nothing matched the filter. Recorded as a `no_data` completion.
    #[error("No data: {0}")]
    NoData(String),

    /// Intersection / geometry post-processing failed for a dataset.
    #[error("Processing error: {0}")]
    Processing(String),

    /// The output store rejected a dataset.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Anything unclassified, including panics caught at the pipeline boundary.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl CollectorError {
    /// Short, stable error code for logs and run records.
    pub fn code(&self) -> &'static str {
        match self {
            CollectorError::Configuration(_) => "CONFIGURATION_ERROR",
            CollectorError::Access(_) => "ACCESS_ERROR",
            CollectorError::NoData(_) => "NO_DATA",
            CollectorError::Processing(_) => "PROCESSING_ERROR",
            CollectorError::Storage(_) => "STORAGE_ERROR",
            CollectorError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            CollectorError::Configuration(_) => ErrorScope::Job,
            CollectorError::Access(_) | CollectorError::Unknown(_) => ErrorScope::Run,
            CollectorError::Processing(_) | CollectorError::Storage(_) => ErrorScope::DataSet,
            CollectorError::NoData(_) => ErrorScope::None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, CollectorError::NoData(_))
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_is_not_a_failure() {
        let e = CollectorError::NoData("empty table".into());
        assert!(e.is_no_data());
        assert_eq!(e.scope(), ErrorScope::None);
        assert_eq!(e.code(), "NO_DATA");
    }

    #[test]
    fn dataset_errors_do_not_escalate() {
        assert_eq!(CollectorError::Processing("x".into()).scope(), ErrorScope::DataSet);
        assert_eq!(CollectorError::Storage("x".into()).scope(), ErrorScope::DataSet);
        assert_eq!(CollectorError::Access("x".into()).scope(), ErrorScope::Run);
    }

    #[test]
    fn display_includes_category() {
        let e = CollectorError::Configuration("frequency must be positive".into());
        assert_eq!(e.to_string(), "Configuration error: frequency must be positive");
    }
}
