//! `geocollect-scheduler`: decides when collection jobs run, queues them and
//! drives each run through its pipeline.
//!
//! # Overview
//!
//! The [`registry::Registry`] holds job configuration and publishes
//! [`types::ConfigEvent`]s on change. The [`service::CollectorService`] reacts
//! by arming or disarming timers in the [`timers::TimerSet`]. A timer tick
//! pushes the job id onto the [`queue::RunQueue`]; the
//! [`dispatcher::Dispatcher`] drains it onto a bounded worker pool, and each
//! run goes through the [`pipeline::RunPipeline`]. Outcomes land in the run
//! log, whose last recorded timestamp bounds the next fetch.
//!
//! # Schedule variants
//!
//! | Variant     | Behaviour                                         |
//! |-------------|---------------------------------------------------|
//! | `Frequency` | Every N seconds / minutes / hours / days / weeks  |
//! | `Daily`     | At HH:MM UTC every day                            |
//! | `Weekly`    | At HH:MM UTC on a given weekday                   |
//! | `Cron`      | Cron expression with a leading seconds field      |

pub mod access;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod timers;
pub mod types;

pub use access::{Collaborators, DataAccessor, DataStorager, IntersectionOperation};
pub use dispatcher::Dispatcher;
pub use error::{Result, SchedulerError};
pub use pipeline::RunPipeline;
pub use queue::RunQueue;
pub use registry::{PreparedRun, Registry};
pub use service::CollectorService;
pub use timers::TimerSet;
pub use types::{ArmOutcome, ConfigEvent, DataSetFailure, PipelineState, RunOutcome};
