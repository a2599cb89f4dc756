use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;

use crate::chunkenc::{encode_samples, ChunkData, ChunkEncoding};
use crate::common::{LabelSet, Matcher, Matchers, Sample};
use crate::config::AgentSettings;
use crate::error::{VaultError, VaultResult};
use crate::store::head::HeadSource;
use crate::store::shipper::ShipMark;
use crate::store::{
    effective_limit, fuse_on_error, stamp_series, EndpointInfo, RawSeries, SeriesEndpoint,
    SeriesFrame, SeriesRequest, SeriesStream, Warning,
};

/// Endpoint fronting one local head window.
///
/// Serves what the head holds, stamped with the agent's external labels, and
/// clamped to the not yet shipped part of the window; shipped data belongs to
/// the gateways. Chunks are cut and encoded on demand, the head itself stores
/// plain samples.
pub struct AgentStore<H> {
    name: String,
    head: Arc<H>,
    external: LabelSet,
    encoding: ChunkEncoding,
    samples_per_chunk: usize,
    max_series: usize,
    mark: Arc<ShipMark>,
}

impl<H: HeadSource> AgentStore<H> {
    pub fn new(
        name: impl Into<String>,
        head: Arc<H>,
        settings: &AgentSettings,
        mark: Arc<ShipMark>,
    ) -> VaultResult<AgentStore<H>> {
        settings.validate()?;
        Ok(AgentStore {
            name: name.into(),
            head,
            external: settings.external_label_set(),
            encoding: settings.chunk_encoding,
            samples_per_chunk: settings.samples_per_chunk,
            max_series: settings.max_series,
            mark,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<H: HeadSource> SeriesEndpoint for AgentStore<H> {
    async fn info(&self) -> VaultResult<EndpointInfo> {
        let Some(range) = self.head.time_range() else {
            return Ok(EndpointInfo::empty());
        };
        let min = range.start.max(self.mark.first_unshipped());
        let max = range.end;
        if min > max {
            return Ok(EndpointInfo::empty());
        }
        let label_sets = if self.external.is_empty() {
            Vec::new()
        } else {
            vec![self.external.clone()]
        };
        Ok(EndpointInfo {
            label_sets,
            min_time: min,
            max_time: max,
        })
    }

    async fn series(&self, request: SeriesRequest) -> VaultResult<SeriesStream> {
        request.validate()?;

        let start = request.min_time.max(self.mark.first_unshipped());
        if start > request.max_time {
            return Ok(empty_stream());
        }

        // Matchers naming an external label are decided here, against the
        // stamped value; the head only ever sees the rest.
        let (external_ms, head_ms): (Vec<Matcher>, Vec<Matcher>) = request
            .matchers
            .iter()
            .cloned()
            .partition(|m| self.external.contains_name(&m.name));
        let external_ok = external_ms
            .iter()
            .all(|m| self.external.get(&m.name).map_or(false, |v| m.matches(v)));
        if !external_ok {
            return Ok(empty_stream());
        }

        let selected = self
            .head
            .select(&Matchers::new(head_ms), start, request.max_time)?;
        let (stamped, collided) = stamp_series(selected, &self.external);

        let warnings: Vec<VaultResult<SeriesFrame>> = collided
            .into_iter()
            .map(|name| {
                Ok(SeriesFrame::Warning(Warning::new(
                    self.name.clone(),
                    format!("external label \"{name}\" overrode a stored label"),
                )))
            })
            .collect();

        let limit = effective_limit(request.limit, self.max_series);
        let take = if limit > 0 { limit + 1 } else { usize::MAX };
        let encoding = self.encoding;
        let samples_per_chunk = self.samples_per_chunk;
        let skip = request.skip_chunks;
        let data = stamped
            .into_iter()
            .take(take)
            .enumerate()
            .map(move |(i, (labels, samples))| {
                if limit > 0 && i >= limit {
                    return Err(VaultError::SeriesLimitExceeded(limit));
                }
                let chunks = if skip {
                    metadata_chunks(&samples, samples_per_chunk, encoding)
                } else {
                    encode_chunks(&samples, samples_per_chunk, encoding)?
                };
                Ok(SeriesFrame::Series(RawSeries { labels, chunks }))
            });

        Ok(fuse_on_error(stream::iter(
            warnings.into_iter().chain(data),
        )))
    }
}

fn empty_stream() -> SeriesStream {
    Box::pin(stream::empty())
}

fn encode_chunks(
    samples: &[Sample],
    per_chunk: usize,
    encoding: ChunkEncoding,
) -> VaultResult<Vec<ChunkData>> {
    samples
        .chunks(per_chunk)
        .map(|run| encode_samples(run, encoding))
        .collect()
}

/// Chunk boundaries without the encode cost, for `skip_chunks` requests.
fn metadata_chunks(samples: &[Sample], per_chunk: usize, encoding: ChunkEncoding) -> Vec<ChunkData> {
    samples
        .chunks(per_chunk)
        .map(|run| ChunkData {
            min_time: run[0].timestamp,
            max_time: run[run.len() - 1].timestamp,
            num_samples: run.len() as u32,
            encoding,
            data: Vec::new(),
        })
        .collect()
}
