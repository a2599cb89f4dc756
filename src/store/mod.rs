use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::chunkenc::ChunkData;
use crate::common::{LabelSet, Matchers, Sample, Timestamp};
use crate::error::{VaultError, VaultResult};

mod agent;
mod cache;
mod gateway;
mod head;
mod shipper;

pub use agent::AgentStore;
pub use cache::IndexCache;
pub use gateway::GatewayStore;
pub use head::{HeadSource, MemHead};
pub use shipper::{ShipMark, Shipper};

/// One `Series` call: which series, which window, whether chunk payloads are
/// wanted at all.
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub matchers: Matchers,
    pub min_time: Timestamp,
    pub max_time: Timestamp,

    /// Return chunk metadata without payloads.
    pub skip_chunks: bool,

    /// Maximum series the caller will accept. Zero is unlimited. An endpoint
    /// fails its stream rather than truncate silently.
    pub limit: usize,
}

impl SeriesRequest {
    pub fn new(matchers: Matchers, min_time: Timestamp, max_time: Timestamp) -> SeriesRequest {
        SeriesRequest {
            matchers,
            min_time,
            max_time,
            skip_chunks: false,
            limit: 0,
        }
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.min_time > self.max_time {
            return Err(VaultError::InvalidTimeRange(self.min_time, self.max_time));
        }
        Ok(())
    }
}

/// One series as streamed by an endpoint: full labels plus chunks in time
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSeries {
    pub labels: LabelSet,
    pub chunks: Vec<ChunkData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Endpoint or block the warning is about.
    pub origin: String,
    pub message: String,
}

impl Warning {
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Warning {
        Warning {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

impl Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

/// Wire frame of a `Series` stream. Warnings ride the same stream as data so
/// an endpoint can report a skipped block without failing the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeriesFrame {
    Series(RawSeries),
    Warning(Warning),
}

/// Advertisement returned by `Info`. Used for pruning only; conservative, may
/// over-advertise, and never trusted as exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub label_sets: Vec<LabelSet>,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
}

impl EndpointInfo {
    /// An advertisement that intersects no query: what an endpoint with no
    /// data returns.
    pub fn empty() -> EndpointInfo {
        EndpointInfo {
            label_sets: Vec::new(),
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
        }
    }

    /// An advertisement that intersects every query. Used for endpoints
    /// nobody has polled yet, so pruning never hides them.
    pub fn unbounded() -> EndpointInfo {
        EndpointInfo {
            label_sets: Vec::new(),
            min_time: Timestamp::MIN,
            max_time: Timestamp::MAX,
        }
    }

    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }

    /// Whether any advertised label set admits the matchers. With no
    /// advertised sets nothing can be ruled out.
    pub fn could_serve(&self, matchers: &Matchers) -> bool {
        if self.label_sets.is_empty() {
            return true;
        }
        self.label_sets.iter().any(|ls| matchers.could_match(ls))
    }
}

pub type SeriesStream = BoxStream<'static, VaultResult<SeriesFrame>>;

/// The protocol every serving endpoint implements, agent and gateway alike.
/// The sole contract between the query layer and its sources.
#[async_trait]
pub trait SeriesEndpoint: Send + Sync + 'static {
    async fn info(&self) -> VaultResult<EndpointInfo>;

    /// Series ordered by label set, warnings interleaved, ending normally or
    /// at the first error.
    async fn series(&self, request: SeriesRequest) -> VaultResult<SeriesStream>;
}

/// Combines the caller's limit with the server's own cap. Zero means
/// unlimited on either side.
pub(crate) fn effective_limit(request_limit: usize, server_limit: usize) -> usize {
    match (request_limit, server_limit) {
        (0, s) => s,
        (r, 0) => r,
        (r, s) => r.min(s),
    }
}

/// Boxes a frame stream and ends it right after its first error, the way
/// endpoint streams terminate.
pub(crate) fn fuse_on_error<S>(stream: S) -> SeriesStream
where
    S: Stream<Item = VaultResult<SeriesFrame>> + Send + 'static,
{
    Box::pin(stream.scan(false, |failed, item| {
        let emit = if *failed {
            None
        } else {
            *failed = item.is_err();
            Some(item)
        };
        futures::future::ready(emit)
    }))
}

/// Overlays `external` onto every series and regroups by the stamped
/// identity. Distinct stored series can collapse into one once stamped;
/// their samples are merged in time order, and on a duplicate timestamp the
/// series earlier in stored order wins. Also returns every stored label name
/// an external label overrode.
pub(crate) fn stamp_series(
    series: Vec<(LabelSet, Vec<Sample>)>,
    external: &LabelSet,
) -> (BTreeMap<LabelSet, Vec<Sample>>, BTreeSet<String>) {
    let mut stamped: BTreeMap<LabelSet, Vec<Sample>> = BTreeMap::new();
    let mut collided = BTreeSet::new();
    for (labels, samples) in series {
        let (merged, names) = labels.with_overrides(external);
        collided.extend(names);
        match stamped.entry(merged) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(samples);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                merge_samples(e.get_mut(), samples);
            }
        }
    }
    (stamped, collided)
}

/// Merges two timestamp-sorted runs. `into` wins on a duplicate timestamp.
fn merge_samples(into: &mut Vec<Sample>, other: Vec<Sample>) {
    let mut merged = Vec::with_capacity(into.len() + other.len());
    let mut a = into.drain(..).peekable();
    let mut b = other.into_iter().peekable();
    while let (Some(&x), Some(&y)) = (a.peek(), b.peek()) {
        if y.timestamp < x.timestamp {
            merged.push(y);
            b.next();
        } else {
            if y.timestamp == x.timestamp {
                b.next();
            }
            merged.push(x);
            a.next();
        }
    }
    merged.extend(a);
    merged.extend(b);
    *into = merged;
}
