use crate::chunkenc::{encode_samples, ChunkData, ChunkEncoding};
use crate::common::{LabelSet, Sample, Timestamp};
use crate::error::{VaultError, VaultResult};

use super::{BlockId, BlockMeta, BlockStats, ChunkRef, SeriesEntry};

/// Assembles one immutable block from label-sorted series data.
///
/// Series must be appended in strict label order. Chunks are cut every
/// `samples_per_chunk` samples and laid out back to back in a single chunk
/// artifact; refs point into it by offset.
pub struct BlockWriter {
    labels: LabelSet,
    encoding: ChunkEncoding,
    samples_per_chunk: usize,
    entries: Vec<SeriesEntry>,
    payload: Vec<u8>,
    stats: BlockStats,
    min_time: Timestamp,
    max_time: Timestamp,
}

impl BlockWriter {
    pub fn new(
        labels: LabelSet,
        encoding: ChunkEncoding,
        samples_per_chunk: usize,
    ) -> VaultResult<BlockWriter> {
        if samples_per_chunk == 0 {
            return Err(VaultError::InvalidConfiguration(
                "samples_per_chunk must be at least 1".to_string(),
            ));
        }
        Ok(BlockWriter {
            labels,
            encoding,
            samples_per_chunk,
            entries: Vec::new(),
            payload: Vec::new(),
            stats: BlockStats::default(),
            min_time: Timestamp::MAX,
            max_time: Timestamp::MIN,
        })
    }

    pub fn num_series(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends one series. Samples must be sorted by timestamp; an empty
    /// sample run is a no-op.
    pub fn append_series(&mut self, labels: LabelSet, samples: &[Sample]) -> VaultResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.entries.last() {
            if last.labels >= labels {
                return Err(VaultError::OutOfOrderSeries(
                    labels.to_string(),
                    last.labels.to_string(),
                ));
            }
        }

        let mut chunks = Vec::with_capacity(samples.len().div_ceil(self.samples_per_chunk));
        for run in samples.chunks(self.samples_per_chunk) {
            let chunk = encode_samples(run, self.encoding)?;
            chunks.push(self.push_payload(&chunk));
        }

        self.stats.num_series += 1;
        self.entries.push(SeriesEntry { labels, chunks });
        Ok(())
    }

    fn push_payload(&mut self, chunk: &ChunkData) -> ChunkRef {
        let offset = self.payload.len() as u64;
        self.payload.extend_from_slice(&chunk.data);
        self.min_time = self.min_time.min(chunk.min_time);
        self.max_time = self.max_time.max(chunk.max_time);
        self.stats.num_chunks += 1;
        self.stats.num_samples += u64::from(chunk.num_samples);
        ChunkRef {
            offset,
            len: chunk.data.len() as u32,
            min_time: chunk.min_time,
            max_time: chunk.max_time,
            num_samples: chunk.num_samples,
            encoding: chunk.encoding,
        }
    }

    pub fn finish(self) -> VaultResult<FinishedBlock> {
        if self.entries.is_empty() {
            return Err(VaultError::EmptyBlock);
        }
        let meta = BlockMeta {
            id: BlockId::random(),
            min_time: self.min_time,
            max_time: self.max_time,
            labels: self.labels,
            stats: self.stats,
        };
        Ok(FinishedBlock {
            meta,
            series: self.entries,
            chunk_payload: self.payload,
        })
    }
}

/// The three artifacts of one block, ready for upload.
pub struct FinishedBlock {
    pub meta: BlockMeta,
    pub series: Vec<SeriesEntry>,
    pub chunk_payload: Vec<u8>,
}

impl FinishedBlock {
    pub fn meta_bytes(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(&self.meta).map_err(|e| VaultError::CannotSerialize(e.to_string()))
    }

    pub fn index_bytes(&self) -> VaultResult<Vec<u8>> {
        serde_json::to_vec(&self.series).map_err(|e| VaultError::CannotSerialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::generators::generate_samples;

    #[test]
    fn test_chunks_are_cut_and_addressable() {
        let samples = generate_samples(3, 250, 1000, 10_000);
        let mut writer =
            BlockWriter::new(LabelSet::default(), ChunkEncoding::Xor, 100).unwrap();
        writer
            .append_series(LabelSet::from_pairs(&[("job", "api")]), &samples)
            .unwrap();
        let block = writer.finish().unwrap();

        assert_eq!(block.meta.stats.num_series, 1);
        assert_eq!(block.meta.stats.num_chunks, 3);
        assert_eq!(block.meta.stats.num_samples, 250);
        assert_eq!(block.meta.min_time, samples[0].timestamp);
        assert_eq!(block.meta.max_time, samples[249].timestamp);

        // every ref decodes back to its slice of the input
        let mut decoded = Vec::new();
        for r in &block.series[0].chunks {
            let data =
                block.chunk_payload[r.offset as usize..(r.offset + u64::from(r.len)) as usize].to_vec();
            let chunk = ChunkData {
                min_time: r.min_time,
                max_time: r.max_time,
                num_samples: r.num_samples,
                encoding: r.encoding,
                data,
            };
            for s in chunk.iter().unwrap() {
                decoded.push(s.unwrap());
            }
        }
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_series_must_arrive_in_label_order() {
        let samples = generate_samples(4, 10, 0, 1000);
        let mut writer =
            BlockWriter::new(LabelSet::default(), ChunkEncoding::Xor, 100).unwrap();
        writer
            .append_series(LabelSet::from_pairs(&[("job", "b")]), &samples)
            .unwrap();
        let err = writer
            .append_series(LabelSet::from_pairs(&[("job", "a")]), &samples)
            .unwrap_err();
        assert!(matches!(err, VaultError::OutOfOrderSeries(_, _)));

        // duplicates are out of order too
        let err = writer
            .append_series(LabelSet::from_pairs(&[("job", "b")]), &samples)
            .unwrap_err();
        assert!(matches!(err, VaultError::OutOfOrderSeries(_, _)));
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let writer = BlockWriter::new(LabelSet::default(), ChunkEncoding::Xor, 100).unwrap();
        assert!(matches!(writer.finish(), Err(VaultError::EmptyBlock)));

        // appending no samples does not create an entry
        let mut writer = BlockWriter::new(LabelSet::default(), ChunkEncoding::Xor, 100).unwrap();
        writer
            .append_series(LabelSet::from_pairs(&[("job", "a")]), &[])
            .unwrap();
        assert!(writer.is_empty());
    }

    #[test]
    fn test_index_artifact_round_trips() {
        let samples = generate_samples(5, 20, 0, 1000);
        let mut writer =
            BlockWriter::new(LabelSet::from_pairs(&[("replica", "a")]), ChunkEncoding::Pco, 16)
                .unwrap();
        writer
            .append_series(LabelSet::from_pairs(&[("job", "api")]), &samples)
            .unwrap();
        let block = writer.finish().unwrap();

        let decoded: Vec<SeriesEntry> =
            serde_json::from_slice(&block.index_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block.series);

        let meta: BlockMeta = serde_json::from_slice(&block.meta_bytes().unwrap()).unwrap();
        assert_eq!(meta, block.meta);
        assert_eq!(meta.labels.get("replica"), Some("a"));
    }
}
