use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunkenc::ChunkEncoding;
use crate::common::{Label, LabelSet};
use crate::error::{VaultError, VaultResult};

pub const DEFAULT_REPLICA_LABEL: &str = "replica";
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(120);
pub const DEFAULT_STREAM_BUFFER: usize = 64;
pub const DEFAULT_INDEX_CACHE_CAPACITY: usize = 128;
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 120;

/// Width of the head window a single shipped block covers.
pub const DEFAULT_BLOCK_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

/// Knobs for the fan-out and merge side of a query node. Passed explicitly
/// into the components that need them; there is no process-wide settings
/// singleton.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Label distinguishing redundant scrapers of the same targets. Stripped
    /// from every merged series.
    pub replica_label: String,

    /// Upper bound on endpoint calls in flight for one query.
    pub max_concurrent_requests: usize,

    /// Deadline applied to each endpoint call, on top of whatever global
    /// deadline the caller set.
    pub endpoint_timeout: Duration,

    /// Frames buffered per endpoint stream before backpressure kicks in.
    pub stream_buffer: usize,

    /// Fail the whole query when any endpoint fails, instead of degrading to
    /// a warning.
    pub require_all: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            replica_label: DEFAULT_REPLICA_LABEL.to_string(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            require_all: false,
        }
    }
}

impl QuerySettings {
    pub fn validate(&self) -> VaultResult<()> {
        if self.replica_label.is_empty() {
            return Err(VaultError::InvalidConfiguration(
                "replica_label must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(VaultError::InvalidConfiguration(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(VaultError::InvalidConfiguration(
                "stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.endpoint_timeout.is_zero() {
            return Err(VaultError::InvalidConfiguration(
                "endpoint_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Knobs for a gateway serving blocks out of object storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Block indexes kept decoded in memory, LRU evicted.
    pub index_cache_capacity: usize,

    /// Maximum series one request may return. Zero is unlimited.
    pub max_series: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            index_cache_capacity: DEFAULT_INDEX_CACHE_CAPACITY,
            max_series: 0,
        }
    }
}

impl GatewaySettings {
    pub fn validate(&self) -> VaultResult<()> {
        if self.index_cache_capacity == 0 {
            return Err(VaultError::InvalidConfiguration(
                "index_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Knobs for an agent sitting next to one scraping database instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Labels stamped onto every series this agent serves or ships, on top
    /// of whatever the local database recorded. On a name collision the
    /// external value wins.
    pub external_labels: HashMap<String, String>,

    /// Head window covered by one shipped block.
    pub block_window: Duration,

    /// Samples per chunk when cutting head data into chunks.
    pub samples_per_chunk: usize,

    /// Encoding used for freshly cut chunks.
    pub chunk_encoding: ChunkEncoding,

    /// Maximum series one request may return. Zero is unlimited.
    pub max_series: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            external_labels: HashMap::new(),
            block_window: DEFAULT_BLOCK_WINDOW,
            samples_per_chunk: DEFAULT_SAMPLES_PER_CHUNK,
            chunk_encoding: ChunkEncoding::default(),
            max_series: 0,
        }
    }
}

impl AgentSettings {
    /// The external labels as a sorted label set, ready to overlay onto
    /// served and shipped series.
    pub fn external_label_set(&self) -> LabelSet {
        LabelSet::new(
            self.external_labels
                .iter()
                .map(|(n, v)| Label::new(n.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.block_window.is_zero() {
            return Err(VaultError::InvalidConfiguration(
                "block_window must be positive".to_string(),
            ));
        }
        if self.samples_per_chunk == 0 {
            return Err(VaultError::InvalidConfiguration(
                "samples_per_chunk must be at least 1".to_string(),
            ));
        }
        for name in self.external_labels.keys() {
            if name.is_empty() {
                return Err(VaultError::InvalidConfiguration(
                    "external label names must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        QuerySettings::default().validate().unwrap();
        GatewaySettings::default().validate().unwrap();
        AgentSettings::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let mut q = QuerySettings::default();
        q.replica_label.clear();
        assert!(q.validate().is_err());

        let mut q = QuerySettings::default();
        q.max_concurrent_requests = 0;
        assert!(q.validate().is_err());

        let mut g = GatewaySettings::default();
        g.index_cache_capacity = 0;
        assert!(g.validate().is_err());

        let mut a = AgentSettings::default();
        a.samples_per_chunk = 0;
        assert!(a.validate().is_err());

        let mut a = AgentSettings::default();
        a.external_labels.insert(String::new(), "x".to_string());
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_external_label_set_is_sorted() {
        let mut a = AgentSettings::default();
        a.external_labels
            .insert("replica".to_string(), "a".to_string());
        a.external_labels
            .insert("region".to_string(), "eu".to_string());
        assert_eq!(
            a.external_label_set(),
            LabelSet::from_pairs(&[("region", "eu"), ("replica", "a")])
        );
    }

    #[test]
    fn test_settings_round_trip_through_json() {
        let q = QuerySettings::default();
        let json = serde_json::to_string(&q).unwrap();
        let back: QuerySettings = serde_json::from_str(&json).unwrap();
        assert_eq!(q, back);
    }
}
