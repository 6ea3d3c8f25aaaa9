use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a transparent integer identifier with the conversions every id shares.
macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

numeric_id!(
    /// Identifies a configured collection job.
    JobId(u64)
);
numeric_id!(
    /// Identifies a data series (a named group of datasets behind one provider).
    DataSeriesId(u64)
);
numeric_id!(
    /// Identifies a single dataset inside a data series.
    DataSetId(u64)
);
numeric_id!(DataProviderId(u64));
numeric_id!(
    /// Identifies one service process in a fleet. Jobs are owned by exactly one instance.
    InstanceId(u32)
);

/// Identifier of a single pipeline execution (UUIDv7, time-sortable, so run
/// history orders naturally by id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
