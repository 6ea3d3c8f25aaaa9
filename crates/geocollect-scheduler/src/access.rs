//! Seams to the collaborators that actually move data: accessors read input
//! series, storagers write output series, an intersection operation annotates
//! records with auxiliary geometry. The scheduling core only orchestrates them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use geocollect_core::{
    CollectorError, DataProvider, DataSeries, DataSet, FetchedDataSet, Filter, IntersectionPolicy,
    Record, Result,
};

/// Reads an input series.
#[async_trait]
pub trait DataAccessor: Send + Sync {
    /// Fetch every dataset of `series` that matches `filter`.
    ///
    /// Fails with `Access` when the provider is unreachable. An empty result
    /// and a `NoData` error are treated the same way by the pipeline.
    async fn fetch(
        &self,
        provider: &DataProvider,
        series: &DataSeries,
        filter: &Filter,
    ) -> Result<Vec<FetchedDataSet>>;
}

/// Writes records into one dataset of an output series.
#[async_trait]
pub trait DataStorager: Send + Sync {
    /// Returns the number of records written. Fails with `Storage`.
    async fn store(
        &self,
        provider: &DataProvider,
        series: &DataSeries,
        dataset: &DataSet,
        records: &[Record],
    ) -> Result<usize>;
}

/// Clips or annotates fetched records with auxiliary geometry series.
#[async_trait]
pub trait IntersectionOperation: Send + Sync {
    /// `layers` holds the resolved series of `policy`, in policy order.
    /// Fails with `Processing`.
    async fn intersect(
        &self,
        policy: &IntersectionPolicy,
        layers: &[DataSeries],
        dataset: &DataSet,
        records: Vec<Record>,
    ) -> Result<Vec<Record>>;
}

/// Accessors keyed by provider kind, storagers keyed by output series format.
#[derive(Clone, Default)]
pub struct Collaborators {
    accessors: HashMap<String, Arc<dyn DataAccessor>>,
    storagers: HashMap<String, Arc<dyn DataStorager>>,
    intersection: Option<Arc<dyn IntersectionOperation>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accessor(mut self, kind: impl Into<String>, accessor: Arc<dyn DataAccessor>) -> Self {
        self.accessors.insert(kind.into(), accessor);
        self
    }

    pub fn with_storager(mut self, format: impl Into<String>, storager: Arc<dyn DataStorager>) -> Self {
        self.storagers.insert(format.into(), storager);
        self
    }

    pub fn with_intersection(mut self, op: Arc<dyn IntersectionOperation>) -> Self {
        self.intersection = Some(op);
        self
    }

    pub fn accessor(&self, kind: &str) -> Result<Arc<dyn DataAccessor>> {
        self.accessors.get(kind).cloned().ok_or_else(|| {
            CollectorError::Configuration(format!("no data accessor for provider kind {kind:?}"))
        })
    }

    pub fn storager(&self, format: &str) -> Result<Arc<dyn DataStorager>> {
        self.storagers.get(format).cloned().ok_or_else(|| {
            CollectorError::Configuration(format!("no data storager for format {format:?}"))
        })
    }

    pub fn intersection(&self) -> Result<Arc<dyn IntersectionOperation>> {
        self.intersection
            .clone()
            .ok_or_else(|| CollectorError::Configuration("no intersection operation registered".into()))
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut accessors: Vec<_> = self.accessors.keys().collect();
        accessors.sort();
        let mut storagers: Vec<_> = self.storagers.keys().collect();
        storagers.sort();
        f.debug_struct("Collaborators")
            .field("accessors", &accessors)
            .field("storagers", &storagers)
            .field("intersection", &self.intersection.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl DataAccessor for Nothing {
        async fn fetch(
            &self,
            _provider: &DataProvider,
            _series: &DataSeries,
            _filter: &Filter,
        ) -> Result<Vec<FetchedDataSet>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn lookups_by_key() {
        let c = Collaborators::new().with_accessor("postgis", Arc::new(Nothing));
        assert!(c.accessor("postgis").is_ok());
        assert_eq!(c.accessor("ftp").err().map(|e| e.code()), Some("CONFIGURATION_ERROR"));
        assert!(c.storager("OCCURRENCE-postgis").is_err());
        assert!(c.intersection().is_err());
        assert!(format!("{c:?}").contains("postgis"));
    }
}
