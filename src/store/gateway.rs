use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use crate::block::{BlockId, BlockMeta, ChunkRef, META_FILENAME};
use crate::chunkenc::ChunkData;
use crate::common::LabelSet;
use crate::config::GatewaySettings;
use crate::error::{VaultError, VaultResult};
use crate::objstore::ObjectBucket;
use crate::store::cache::IndexCache;
use crate::store::{
    effective_limit, fuse_on_error, EndpointInfo, RawSeries, SeriesEndpoint, SeriesFrame,
    SeriesRequest, SeriesStream, Warning,
};

/// Endpoint serving completed blocks out of an object bucket.
///
/// Only blocks whose `meta.json` exists are visible, so a shipper writing its
/// artifacts in order never exposes a half written block here. `sync_blocks`
/// refreshes the visible set; a query runs against whatever snapshot the last
/// sync installed.
pub struct GatewayStore<B> {
    name: String,
    bucket: Arc<B>,
    cache: IndexCache,
    max_series: usize,
    snapshot: RwLock<Arc<Vec<BlockMeta>>>,
}

enum Planned {
    Warning(Warning),
    Series(LabelSet, Vec<(BlockId, ChunkRef)>),
    OverLimit(usize),
}

impl<B: ObjectBucket> GatewayStore<B> {
    pub fn new(
        name: impl Into<String>,
        bucket: Arc<B>,
        settings: &GatewaySettings,
    ) -> VaultResult<GatewayStore<B>> {
        settings.validate()?;
        Ok(GatewayStore {
            name: name.into(),
            bucket,
            cache: IndexCache::new(settings.index_cache_capacity),
            max_series: settings.max_series,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_blocks(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    /// Re-lists the bucket and swaps in the current set of complete blocks.
    /// In-flight queries keep the snapshot they started with. Blocks with an
    /// unreadable or inconsistent meta are left out and logged, not fatal.
    pub async fn sync_blocks(&self) -> VaultResult<usize> {
        let keys = self.bucket.list("").await?;
        let mut metas = Vec::new();
        for key in keys {
            let Some(id) = block_id_of_meta_key(&key) else {
                continue;
            };
            let meta = match self.fetch_meta(&key).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!("skipping block {}: {}", id, e);
                    continue;
                }
            };
            if meta.id != id {
                tracing::warn!("skipping block {}: meta declares id {}", id, meta.id);
                continue;
            }
            metas.push(meta);
        }
        metas.sort_by_key(|m| (m.min_time, m.id));
        let count = metas.len();
        *self.snapshot.write().unwrap() = Arc::new(metas);
        tracing::debug!("synced {} complete blocks", count);
        Ok(count)
    }

    async fn fetch_meta(&self, key: &str) -> VaultResult<BlockMeta> {
        let bytes = self.bucket.get(key).await?;
        let meta: BlockMeta = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::CannotDeserialize(format!("meta artifact {key}: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }
}

#[async_trait]
impl<B: ObjectBucket> SeriesEndpoint for GatewayStore<B> {
    async fn info(&self) -> VaultResult<EndpointInfo> {
        let snapshot = self.snapshot.read().unwrap().clone();
        let mut info = EndpointInfo::empty();
        let mut sets = BTreeSet::new();
        for meta in snapshot.iter() {
            info.min_time = info.min_time.min(meta.min_time);
            info.max_time = info.max_time.max(meta.max_time);
            // an unlabeled block advertises the empty set, which rules
            // nothing out
            sets.insert(meta.labels.clone());
        }
        info.label_sets = sets.into_iter().collect();
        Ok(info)
    }

    async fn series(&self, request: SeriesRequest) -> VaultResult<SeriesStream> {
        request.validate()?;

        let snapshot = self.snapshot.read().unwrap().clone();
        let mut warnings: Vec<Warning> = Vec::new();
        let mut grouped: BTreeMap<LabelSet, Vec<(BlockId, ChunkRef)>> = BTreeMap::new();
        for meta in snapshot.iter() {
            if !meta.overlaps(request.min_time, request.max_time)
                || !request.matchers.could_match(&meta.labels)
            {
                continue;
            }
            let index = match self.cache.get_or_load(self.bucket.as_ref(), meta).await {
                Ok(index) => index,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!("dropping block {} from the result: {}", meta.id, e);
                    warnings.push(Warning::new(
                        self.name.clone(),
                        format!("block {} skipped: {e}", meta.id),
                    ));
                    continue;
                }
            };
            for entry in index.select(&request.matchers, request.min_time, request.max_time) {
                grouped
                    .entry(entry.labels)
                    .or_default()
                    .extend(entry.chunks.into_iter().map(|c| (meta.id, c)));
            }
        }
        // a series split across blocks becomes one run of time-ordered chunks
        for refs in grouped.values_mut() {
            refs.sort_by_key(|(_, c)| (c.min_time, c.max_time));
        }

        let limit = effective_limit(request.limit, self.max_series);
        let take = if limit > 0 { limit + 1 } else { usize::MAX };
        let mut planned: Vec<Planned> = warnings.into_iter().map(Planned::Warning).collect();
        planned.extend(grouped.into_iter().take(take).enumerate().map(
            |(i, (labels, refs))| {
                if limit > 0 && i >= limit {
                    Planned::OverLimit(limit)
                } else {
                    Planned::Series(labels, refs)
                }
            },
        ));

        let bucket = self.bucket.clone();
        let skip = request.skip_chunks;
        let stream = stream::iter(planned).then(move |item| {
            let bucket = bucket.clone();
            async move {
                match item {
                    Planned::Warning(w) => Ok(SeriesFrame::Warning(w)),
                    Planned::OverLimit(limit) => Err(VaultError::SeriesLimitExceeded(limit)),
                    Planned::Series(labels, refs) => {
                        let mut chunks = Vec::with_capacity(refs.len());
                        for (id, r) in refs {
                            chunks.push(fetch_chunk(bucket.as_ref(), &id, &r, skip).await?);
                        }
                        Ok(SeriesFrame::Series(RawSeries { labels, chunks }))
                    }
                }
            }
        });
        Ok(fuse_on_error(stream))
    }
}

fn block_id_of_meta_key(key: &str) -> Option<BlockId> {
    let dir = key.strip_suffix(META_FILENAME)?.strip_suffix('/')?;
    BlockId::parse(dir).ok()
}

async fn fetch_chunk(
    bucket: &dyn ObjectBucket,
    id: &BlockId,
    chunk: &ChunkRef,
    skip: bool,
) -> VaultResult<ChunkData> {
    let data = if skip {
        Vec::new()
    } else {
        bucket
            .get_range(&id.chunks_path(), chunk.offset, u64::from(chunk.len))
            .await?
    };
    Ok(ChunkData {
        min_time: chunk.min_time,
        max_time: chunk.max_time,
        num_samples: chunk.num_samples,
        encoding: chunk.encoding,
        data,
    })
}
