//! `geocollect-runlog`: durable record of every pipeline run.
//!
//! The run log is what makes collection incremental: the latest successful
//! run's observed data timestamp bounds the next fetch, and the latest
//! completed run's start time anchors the next timer fire.

pub mod db;
pub mod error;
pub mod logger;
pub mod types;

pub use error::RunLogError;
pub use logger::{RunLogger, SqliteRunLogger};
pub use types::{RunRecord, RunStatus};
