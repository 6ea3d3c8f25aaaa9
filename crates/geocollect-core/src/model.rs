//! Configuration-side data model: providers, data series, datasets and jobs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::filter::Filter;
use crate::types::{DataProviderId, DataSeriesId, DataSetId, InstanceId, JobId};

/// Where data lives. `kind` selects the accessor / storager implementation
/// (e.g. `"postgis"`, `"ftp"`, `"file"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProvider {
    pub id: DataProviderId,
    pub name: String,
    pub kind: String,
    pub uri: String,
    #[serde(default = "bool_true")]
    pub active: bool,
}

/// One addressable unit of data (a table, a file mask, a station) inside a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    pub id: DataSetId,
    pub series_id: DataSeriesId,
    #[serde(default = "bool_true")]
    pub active: bool,
    /// Format hints consumed by accessors (`table_name`, `mask`, `timezone`, ...).
    #[serde(default)]
    pub format: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSeries {
    pub id: DataSeriesId,
    pub name: String,
    pub provider_id: DataProviderId,
    /// Data format of the series (e.g. `"OCCURRENCE-postgis"`); selects the storager.
    pub format: String,
    #[serde(default)]
    pub datasets: Vec<DataSet>,
}

impl DataSeries {
    pub fn dataset(&self, id: DataSetId) -> Option<&DataSet> {
        self.datasets.iter().find(|d| d.id == id)
    }
}

/// One auxiliary geometry series and the attributes it contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntersectionLayer {
    pub series_id: DataSeriesId,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Auxiliary geometry series used to clip or annotate collected records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntersectionPolicy {
    #[serde(default)]
    pub layers: Vec<IntersectionLayer>,
}

impl IntersectionPolicy {
    pub fn series_ids(&self) -> impl Iterator<Item = DataSeriesId> + '_ {
        self.layers.iter().map(|l| l.series_id)
    }
}

/// Defines when a job fires.
///
/// Validation (positive frequency, known unit, in-range grid fields) happens
/// when a timer is armed, not at deserialization, so a bad schedule never
/// prevents the job from being registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fixed period: `frequency` units of `unit` (`"minutes"`, `"h"`, ...).
    Frequency { frequency: i64, unit: String },

    /// Every day at HH:MM UTC.
    Daily { hour: u8, minute: u8 },

    /// On a weekday (0 = Monday … 6 = Sunday) at HH:MM UTC.
    Weekly { day: u8, hour: u8, minute: u8 },

    /// Cron expression with a leading seconds field (`"0 */15 * * * *"`).
    Cron { expression: String },
}

fn bool_true() -> bool {
    true
}

/// A configured collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Owning service instance. Other instances never arm or run this job.
    pub instance_id: InstanceId,
    #[serde(default = "bool_true")]
    pub active: bool,
    pub input_series: DataSeriesId,
    pub output_series: DataSeriesId,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersection: Option<IntersectionPolicy>,
    /// Input dataset → output dataset. Serialized as a list of
    /// `{ input, output }` pairs so it survives TOML.
    #[serde(default, with = "dataset_map")]
    pub input_output_map: HashMap<DataSetId, DataSetId>,
    pub schedule: Schedule,
}

impl Job {
    pub fn output_dataset_for(&self, input: DataSetId) -> Option<DataSetId> {
        self.input_output_map.get(&input).copied()
    }
}

mod dataset_map {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        input: DataSetId,
        output: DataSetId,
    }

    pub fn serialize<S: Serializer>(
        map: &HashMap<DataSetId, DataSetId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut entries: Vec<Entry> = map
            .iter()
            .map(|(input, output)| Entry {
                input: *input,
                output: *output,
            })
            .collect();
        entries.sort_by_key(|e| e.input);
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<DataSetId, DataSetId>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.input, e.output)).collect())
    }
}

/// A single fetched observation. Geometry and attributes are opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// Fetch result for one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDataSet {
    pub dataset: DataSet,
    pub records: Vec<Record>,
    /// Latest timestamp observed in the input, which may exceed the records
    /// returned (e.g. with `last_value_only`).
    pub max_timestamp: Option<DateTime<Utc>>,
}

impl FetchedDataSet {
    /// Build from records, deriving `max_timestamp` from the data.
    pub fn from_records(dataset: DataSet, records: Vec<Record>) -> Self {
        let max_timestamp = records.iter().map(|r| r.timestamp).max();
        Self {
            dataset,
            records,
            max_timestamp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
