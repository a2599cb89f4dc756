use std::fmt::Display;
use std::str::FromStr;

use get_size::GetSize;
use rand::RngCore;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::chunkenc::ChunkEncoding;
use crate::common::{LabelSet, Timestamp};
use crate::error::{VaultError, VaultResult};

mod index;
mod writer;

pub use index::{BlockIndex, IndexKey};
pub use writer::{BlockWriter, FinishedBlock};

pub const META_FILENAME: &str = "meta.json";
pub const INDEX_FILENAME: &str = "index.json";
pub const CHUNKS_FILENAME: &str = "chunks.bin";

/// Globally unique block identifier: 16 random bytes, rendered as 32 hex
/// digits wherever a block names an object path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId([u8; 16]);

impl BlockId {
    pub fn random() -> BlockId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        BlockId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> BlockId {
        BlockId(bytes)
    }

    pub fn parse(s: &str) -> VaultResult<BlockId> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidBlock(
                s.to_string(),
                "block id must be 32 hex digits".to_string(),
            ));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| {
                VaultError::InvalidBlock(s.to_string(), "block id must be 32 hex digits".to_string())
            })?;
        }
        Ok(BlockId(bytes))
    }

    /// Object path of the block's completion marker. Written last during
    /// upload; a block without it is treated as absent.
    pub fn meta_path(&self) -> String {
        format!("{self}/{META_FILENAME}")
    }

    pub fn index_path(&self) -> String {
        format!("{self}/{INDEX_FILENAME}")
    }

    pub fn chunks_path(&self) -> String {
        format!("{self}/{CHUNKS_FILENAME}")
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for BlockId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockId::parse(s)
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockId::parse(&s).map_err(D::Error::custom)
    }
}

impl GetSize for BlockId {
    fn get_heap_size(&self) -> usize {
        0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct BlockStats {
    pub num_series: u64,
    pub num_chunks: u64,
    pub num_samples: u64,
}

/// Contents of `meta.json`. Presence of this artifact marks the block as
/// fully uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct BlockMeta {
    pub id: BlockId,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    /// External labels of the agent that shipped the block. Used for
    /// advertisement and pruning only; series inside the block already carry
    /// them.
    pub labels: LabelSet,
    pub stats: BlockStats,
}

impl BlockMeta {
    pub fn validate(&self) -> VaultResult<()> {
        if self.min_time > self.max_time {
            return Err(VaultError::InvalidBlock(
                self.id.to_string(),
                format!(
                    "min_time {} is after max_time {}",
                    self.min_time, self.max_time
                ),
            ));
        }
        Ok(())
    }

    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }
}

/// Location and metadata of one chunk inside the block's chunk artifact.
/// Carries enough to answer `skip_chunks` requests without touching the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct ChunkRef {
    pub offset: u64,
    pub len: u32,
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    pub num_samples: u32,
    pub encoding: ChunkEncoding,
}

impl ChunkRef {
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.min_time <= end && self.max_time >= start
    }
}

/// One series row of the index artifact: the full label set plus the refs of
/// its chunks, in time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct SeriesEntry {
    pub labels: LabelSet,
    pub chunks: Vec<ChunkRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Label;

    #[test]
    fn test_block_id_round_trip() {
        let id = BlockId::random();
        let hex = id.to_string();
        assert_eq!(hex.len(), 32);
        assert_eq!(BlockId::parse(&hex).unwrap(), id);
        assert_eq!(hex.parse::<BlockId>().unwrap(), id);
    }

    #[test]
    fn test_block_id_rejects_malformed_input() {
        assert!(BlockId::parse("").is_err());
        assert!(BlockId::parse("abc").is_err());
        assert!(BlockId::parse(&"g".repeat(32)).is_err());
        // 31 digits
        assert!(BlockId::parse(&"0".repeat(31)).is_err());
    }

    #[test]
    fn test_block_id_serializes_as_hex_string() {
        let id = BlockId::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_artifact_paths() {
        let id = BlockId::from_bytes([0; 16]);
        let hex = "0".repeat(32);
        assert_eq!(id.meta_path(), format!("{hex}/meta.json"));
        assert_eq!(id.index_path(), format!("{hex}/index.json"));
        assert_eq!(id.chunks_path(), format!("{hex}/chunks.bin"));
    }

    #[test]
    fn test_meta_validation() {
        let meta = BlockMeta {
            id: BlockId::random(),
            min_time: 100,
            max_time: 50,
            labels: LabelSet::new(vec![Label::new("replica", "a")]),
            stats: BlockStats::default(),
        };
        assert!(meta.validate().is_err());

        let meta = BlockMeta {
            min_time: 50,
            max_time: 100,
            ..meta
        };
        meta.validate().unwrap();
        assert!(meta.overlaps(100, 200));
        assert!(!meta.overlaps(101, 200));
    }
}
