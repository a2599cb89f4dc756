use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::block::{BlockMeta, BlockWriter, FinishedBlock};
use crate::chunkenc::ChunkEncoding;
use crate::common::{LabelSet, Matchers, Timestamp};
use crate::config::AgentSettings;
use crate::error::VaultResult;
use crate::objstore::ObjectBucket;
use crate::store::head::HeadSource;
use crate::store::stamp_series;

/// First timestamp that is not yet durable in object storage.
///
/// Shared between the shipper, which advances it after each upload, and the
/// agent, which clamps its served window to it so that shipped data is
/// answered by gateways instead of twice.
#[derive(Debug)]
pub struct ShipMark(AtomicI64);

impl ShipMark {
    pub fn new() -> ShipMark {
        ShipMark(AtomicI64::new(Timestamp::MIN))
    }

    pub fn first_unshipped(&self) -> Timestamp {
        self.0.load(Ordering::Acquire)
    }

    fn advance_to(&self, ts: Timestamp) {
        self.0.fetch_max(ts, Ordering::AcqRel);
    }
}

impl Default for ShipMark {
    fn default() -> ShipMark {
        ShipMark::new()
    }
}

/// Cuts the aged part of the head into a block and uploads it.
///
/// Upload order keeps partially written blocks invisible: chunk payload
/// first, then the index, then `meta.json`, whose presence marks the block
/// complete. Truncating the head afterwards is the embedder's call.
pub struct Shipper<H, B> {
    head: Arc<H>,
    bucket: Arc<B>,
    external: LabelSet,
    encoding: ChunkEncoding,
    samples_per_chunk: usize,
    window_millis: i64,
    mark: Arc<ShipMark>,
}

impl<H: HeadSource, B: ObjectBucket> Shipper<H, B> {
    pub fn new(
        head: Arc<H>,
        bucket: Arc<B>,
        settings: &AgentSettings,
        mark: Arc<ShipMark>,
    ) -> VaultResult<Shipper<H, B>> {
        settings.validate()?;
        Ok(Shipper {
            head,
            bucket,
            external: settings.external_label_set(),
            encoding: settings.chunk_encoding,
            samples_per_chunk: settings.samples_per_chunk,
            window_millis: settings.block_window.as_millis() as i64,
            mark,
        })
    }

    /// Ships everything older than one block window, keeping the freshest
    /// window in the head. Convenience over [`ship_up_to`] for periodic
    /// driving.
    ///
    /// [`ship_up_to`]: Shipper::ship_up_to
    pub async fn ship_due(&self, now: Timestamp) -> VaultResult<Option<BlockMeta>> {
        self.ship_up_to(now.saturating_sub(self.window_millis)).await
    }

    /// Ships all not yet shipped samples up to and including `cutoff` as one
    /// block. Returns the meta of the uploaded block, or `None` when the
    /// window held no samples. The mark advances either way, so a caller can
    /// drive this on a timer without rescanning old data.
    pub async fn ship_up_to(&self, cutoff: Timestamp) -> VaultResult<Option<BlockMeta>> {
        let start = self.mark.first_unshipped();
        if cutoff < start {
            return Ok(None);
        }

        let series = self.head.select(&Matchers::default(), start, cutoff)?;
        if series.is_empty() {
            self.mark.advance_to(cutoff.saturating_add(1));
            return Ok(None);
        }

        let (stamped, collided) = stamp_series(series, &self.external);
        let mut writer =
            BlockWriter::new(self.external.clone(), self.encoding, self.samples_per_chunk)?;
        for (labels, samples) in stamped {
            writer.append_series(labels, &samples)?;
        }
        let block = writer.finish()?;
        for name in &collided {
            tracing::warn!(
                "external label \"{}\" overrode stored values in block {}",
                name,
                block.meta.id
            );
        }

        self.upload(&block).await?;
        self.mark.advance_to(cutoff.saturating_add(1));
        tracing::info!(
            "shipped block {} covering [{}, {}]: {} series, {} samples",
            block.meta.id,
            block.meta.min_time,
            block.meta.max_time,
            block.meta.stats.num_series,
            block.meta.stats.num_samples
        );
        Ok(Some(block.meta))
    }

    async fn upload(&self, block: &FinishedBlock) -> VaultResult<()> {
        let id = &block.meta.id;
        self.bucket
            .put(&id.chunks_path(), block.chunk_payload.clone())
            .await?;
        self.bucket.put(&id.index_path(), block.index_bytes()?).await?;
        self.bucket.put(&id.meta_path(), block.meta_bytes()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockIndex, SeriesEntry};
    use crate::chunkenc::ChunkData;
    use crate::common::Sample;
    use crate::objstore::MemBucket;
    use crate::store::MemHead;

    fn settings() -> AgentSettings {
        let mut settings = AgentSettings::default();
        settings
            .external_labels
            .insert("replica".to_string(), "a".to_string());
        settings.block_window = std::time::Duration::from_secs(10);
        settings
    }

    fn shipper(
        head: &Arc<MemHead>,
        bucket: &Arc<MemBucket>,
    ) -> Shipper<MemHead, MemBucket> {
        Shipper::new(
            head.clone(),
            bucket.clone(),
            &settings(),
            Arc::new(ShipMark::new()),
        )
        .unwrap()
    }

    async fn read_index(bucket: &MemBucket, meta: &BlockMeta) -> BlockIndex {
        let bytes = bucket.get(&meta.id.index_path()).await.unwrap();
        let series: Vec<SeriesEntry> = serde_json::from_slice(&bytes).unwrap();
        BlockIndex::new(meta.clone(), series).unwrap()
    }

    async fn read_samples(bucket: &MemBucket, meta: &BlockMeta, entry: &SeriesEntry) -> Vec<Sample> {
        let mut out = Vec::new();
        for chunk in &entry.chunks {
            let payload = bucket
                .get_range(&meta.id.chunks_path(), chunk.offset, chunk.len as u64)
                .await
                .unwrap();
            let data = ChunkData {
                min_time: chunk.min_time,
                max_time: chunk.max_time,
                num_samples: chunk.num_samples,
                encoding: chunk.encoding,
                data: payload,
            };
            for sample in data.iter().unwrap() {
                out.push(sample.unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_ship_uploads_a_complete_block() {
        let head = Arc::new(MemHead::new());
        let bucket = Arc::new(MemBucket::new());
        let labels = LabelSet::from_pairs(&[("job", "api")]);
        let samples: Vec<Sample> = (0..10).map(|i| Sample::new(i * 10, i as f64)).collect();
        head.append_all(&labels, &samples).unwrap();

        let shipper = shipper(&head, &bucket);
        let meta = shipper.ship_up_to(49).await.unwrap().unwrap();

        assert!(bucket.get(&meta.id.meta_path()).await.is_ok());
        assert_eq!(meta.labels, LabelSet::from_pairs(&[("replica", "a")]));
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 40);
        assert_eq!(meta.stats.num_series, 1);
        assert_eq!(meta.stats.num_samples, 5);
        assert_eq!(shipper.mark.first_unshipped(), 50);

        // the stored meta matches the returned one
        let stored: BlockMeta =
            serde_json::from_slice(&bucket.get(&meta.id.meta_path()).await.unwrap()).unwrap();
        assert_eq!(stored, meta);

        let index = read_index(&bucket, &meta).await;
        let entries = index.select(&Matchers::default(), 0, 100);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].labels,
            LabelSet::from_pairs(&[("job", "api"), ("replica", "a")])
        );
        assert_eq!(
            read_samples(&bucket, &meta, &entries[0]).await,
            samples[..5].to_vec()
        );
    }

    #[tokio::test]
    async fn test_second_ship_starts_where_the_first_ended() {
        let head = Arc::new(MemHead::new());
        let bucket = Arc::new(MemBucket::new());
        let labels = LabelSet::from_pairs(&[("job", "api")]);
        let samples: Vec<Sample> = (0..10).map(|i| Sample::new(i * 10, i as f64)).collect();
        head.append_all(&labels, &samples).unwrap();

        let shipper = shipper(&head, &bucket);
        shipper.ship_up_to(49).await.unwrap().unwrap();
        let second = shipper.ship_up_to(200).await.unwrap().unwrap();

        assert_eq!(second.min_time, 50);
        assert_eq!(second.max_time, 90);
        assert_eq!(second.stats.num_samples, 5);
        assert_eq!(shipper.mark.first_unshipped(), 201);

        // nothing new, nothing shipped
        assert!(shipper.ship_up_to(150).await.unwrap().is_none());
        assert!(shipper.ship_up_to(300).await.unwrap().is_none());
        assert_eq!(shipper.mark.first_unshipped(), 301);
    }

    #[tokio::test]
    async fn test_empty_window_advances_the_mark_without_a_block() {
        let head = Arc::new(MemHead::new());
        let bucket = Arc::new(MemBucket::new());
        let shipper = shipper(&head, &bucket);

        assert!(shipper.ship_up_to(10).await.unwrap().is_none());
        assert_eq!(shipper.mark.first_unshipped(), 11);
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn test_collapsed_identities_ship_as_one_series() {
        let head = Arc::new(MemHead::new());
        let bucket = Arc::new(MemBucket::new());
        head.append_all(
            &LabelSet::from_pairs(&[("job", "x"), ("replica", "1")]),
            &[Sample::new(0, 1.0), Sample::new(10, 1.0)],
        )
        .unwrap();
        head.append_all(
            &LabelSet::from_pairs(&[("job", "x"), ("replica", "2")]),
            &[Sample::new(0, 2.0), Sample::new(5, 2.0)],
        )
        .unwrap();

        let shipper = shipper(&head, &bucket);
        let meta = shipper.ship_up_to(100).await.unwrap().unwrap();
        assert_eq!(meta.stats.num_series, 1);

        let index = read_index(&bucket, &meta).await;
        let entries = index.select(&Matchers::default(), 0, 100);
        assert_eq!(
            entries[0].labels,
            LabelSet::from_pairs(&[("job", "x"), ("replica", "a")])
        );
        assert_eq!(
            read_samples(&bucket, &meta, &entries[0]).await,
            vec![Sample::new(0, 1.0), Sample::new(5, 2.0), Sample::new(10, 1.0)]
        );
    }

    #[tokio::test]
    async fn test_ship_due_keeps_the_fresh_window() {
        let head = Arc::new(MemHead::new());
        let bucket = Arc::new(MemBucket::new());
        let labels = LabelSet::from_pairs(&[("job", "api")]);
        for ts in [0, 5_000, 12_000, 19_000] {
            head.append(&labels, Sample::new(ts, 1.0)).unwrap();
        }

        // window is 10s, so at now=21s everything up to 11s is due
        let shipper = shipper(&head, &bucket);
        let meta = shipper.ship_due(21_000).await.unwrap().unwrap();
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 5_000);
        assert_eq!(shipper.mark.first_unshipped(), 11_001);
    }
}
