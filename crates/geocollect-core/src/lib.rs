//! `geocollect-core`: identifiers, data model, fetch filters, failure taxonomy
//! and configuration shared by the run log and the scheduler.

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod types;

pub use error::{CollectorError, ErrorScope, Result};
pub use filter::Filter;
pub use model::{
    DataProvider, DataSeries, DataSet, FetchedDataSet, IntersectionLayer, IntersectionPolicy, Job,
    Record, Schedule,
};
pub use types::{DataProviderId, DataSeriesId, DataSetId, InstanceId, JobId, RunId};
