//! Federated time-series retrieval: agents serve their freshest scrape
//! window, gateways serve immutable blocks out of object storage, and a
//! query engine fans requests out over both, merging and deduplicating
//! replicated series into one consistent stream.

pub mod block;
pub mod chunkenc;
pub mod common;
pub mod config;
pub mod error;
pub mod objstore;
pub mod query;
pub mod store;


pub use common::{parse_selector, Label, LabelSet, Matcher, Matchers, Sample, Timestamp};
pub use error::{VaultError, VaultResult};
pub use query::{MergedSeries, QueryEngine, QueryOptions, QueryOutcome, StaticRegistry};
pub use store::{SeriesEndpoint, SeriesFrame, SeriesRequest};
