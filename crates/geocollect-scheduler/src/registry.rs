use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use geocollect_core::config::Catalog;
use geocollect_core::{
    CollectorError, DataProvider, DataProviderId, DataSeries, DataSeriesId, InstanceId, Job, JobId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::types::ConfigEvent;

/// Everything one pipeline run needs, cloned out of the registry so no lock is
/// held while the run performs I/O.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub job: Job,
    pub input_series: DataSeries,
    pub input_provider: DataProvider,
    pub output_series: DataSeries,
    pub output_provider: DataProvider,
    /// Auxiliary series named by the job's intersection policy, in policy order.
    pub intersection_series: Vec<DataSeries>,
}

#[derive(Default)]
struct Inner {
    providers: HashMap<DataProviderId, DataProvider>,
    series: HashMap<DataSeriesId, DataSeries>,
    jobs: HashMap<JobId, Job>,
}

/// Single source of truth for job configuration.
///
/// Job mutations are published as [`ConfigEvent`]s when the registry was built
/// with [`Registry::channel`]. Events are sent while the write lock is held, so
/// consumers see them in mutation order.
pub struct Registry {
    inner: RwLock<Inner>,
    events: Option<mpsc::UnboundedSender<ConfigEvent>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry that publishes no events.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events: None,
        }
    }

    /// A registry plus the receiving end of its configuration events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConfigEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: RwLock::new(Inner::default()),
            events: Some(tx),
        };
        (registry, rx)
    }

    // A panic while holding the lock cannot leave the maps half-updated (every
    // write is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ConfigEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("configuration event dropped: no subscriber");
            }
        }
    }

    pub fn add_provider(&self, provider: DataProvider) {
        debug!(provider_id = %provider.id, kind = %provider.kind, "provider registered");
        self.write().providers.insert(provider.id, provider);
    }

    pub fn add_series(&self, series: DataSeries) {
        debug!(series_id = %series.id, datasets = series.datasets.len(), "series registered");
        self.write().series.insert(series.id, series);
    }

    /// Insert or replace a job and publish `JobAdded`.
    pub fn add_job(&self, job: Job) {
        let mut inner = self.write();
        info!(job_id = %job.id, name = %job.name, instance_id = %job.instance_id, "job added");
        inner.jobs.insert(job.id, job.clone());
        self.publish(ConfigEvent::JobAdded(job));
    }

    /// Replace an existing job and publish `JobUpdated`.
    pub fn update_job(&self, job: Job) -> Result<()> {
        let mut inner = self.write();
        let slot = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(SchedulerError::JobNotFound { id: job.id })?;
        *slot = job.clone();
        info!(job_id = %job.id, "job updated");
        self.publish(ConfigEvent::JobUpdated(job));
        Ok(())
    }

    /// Remove a job and publish `JobRemoved`.
    pub fn remove_job(&self, id: JobId) -> Result<Job> {
        let mut inner = self.write();
        let job = inner
            .jobs
            .remove(&id)
            .ok_or(SchedulerError::JobNotFound { id })?;
        info!(job_id = %id, "job removed");
        self.publish(ConfigEvent::JobRemoved(id));
        Ok(job)
    }

    /// Seed providers, series and jobs from static configuration.
    pub fn load_catalog(&self, catalog: Catalog) {
        let Catalog {
            providers,
            series,
            jobs,
        } = catalog;
        for p in providers {
            self.add_provider(p);
        }
        for s in series {
            self.add_series(s);
        }
        for j in jobs {
            self.add_job(j);
        }
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.read().jobs.get(&id).cloned()
    }

    /// All jobs ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn series(&self, id: DataSeriesId) -> Option<DataSeries> {
        self.read().series.get(&id).cloned()
    }

    pub fn provider(&self, id: DataProviderId) -> Option<DataProvider> {
        self.read().providers.get(&id).cloned()
    }

    pub fn owner_of(&self, id: JobId) -> Option<InstanceId> {
        self.read().jobs.get(&id).map(|j| j.instance_id)
    }

    /// `false` for unknown and deactivated jobs.
    pub fn is_active(&self, id: JobId) -> bool {
        self.read().jobs.get(&id).is_some_and(|j| j.active)
    }

    pub fn job_count(&self) -> usize {
        self.read().jobs.len()
    }

    /// Resolve a job and everything it references in one read-locked pass.
    ///
    /// Fails with a configuration error when the job is missing or inactive,
    /// or when any referenced series or provider is missing or inactive.
    pub fn prepare(&self, id: JobId) -> geocollect_core::Result<PreparedRun> {
        let inner = self.read();

        let job = inner
            .jobs
            .get(&id)
            .ok_or_else(|| CollectorError::Configuration(format!("job {id} not found")))?;
        if !job.active {
            return Err(CollectorError::Configuration(format!("job {id} is inactive")));
        }

        let (input_series, input_provider) = inner.series_with_provider(job.input_series)?;
        let (output_series, output_provider) = inner.series_with_provider(job.output_series)?;

        let mut intersection_series = Vec::new();
        if let Some(policy) = &job.intersection {
            for series_id in policy.series_ids() {
                match inner.series.get(&series_id) {
                    Some(s) => intersection_series.push(s.clone()),
                    None => {
                        return Err(CollectorError::Configuration(format!(
                            "intersection series {series_id} not found"
                        )))
                    }
                }
            }
        }

        let prepared = PreparedRun {
            job: job.clone(),
            input_series: input_series.clone(),
            input_provider: input_provider.clone(),
            output_series: output_series.clone(),
            output_provider: output_provider.clone(),
            intersection_series,
        };
        drop(inner);

        if prepared.job.input_output_map.is_empty() {
            warn!(job_id = %id, "job has no input to output dataset mapping");
        }
        Ok(prepared)
    }
}

impl Inner {
    fn series_with_provider(
        &self,
        id: DataSeriesId,
    ) -> geocollect_core::Result<(&DataSeries, &DataProvider)> {
        let series = self
            .series
            .get(&id)
            .ok_or_else(|| CollectorError::Configuration(format!("data series {id} not found")))?;
        let provider = self.providers.get(&series.provider_id).ok_or_else(|| {
            CollectorError::Configuration(format!(
                "data provider {} of series {id} not found",
                series.provider_id
            ))
        })?;
        if !provider.active {
            return Err(CollectorError::Configuration(format!(
                "data provider {} is inactive",
                provider.id
            )));
        }
        Ok((series, provider))
    }
}
