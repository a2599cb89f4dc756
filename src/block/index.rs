use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Deref;

use croaring::Bitmap64;
use get_size::GetSize;

use crate::common::{MatchOp, Matcher, Matchers, Timestamp};
use crate::error::{VaultError, VaultResult};

use super::{BlockMeta, ChunkRef, SeriesEntry};

/// Postings key: the raw bytes of `name=value`. Label names never contain
/// `=`, so the split is unambiguous, and byte ordering keeps every value of
/// one name in a contiguous key range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Box<[u8]>);

impl IndexKey {
    pub fn for_label_value(name: &str, value: &str) -> IndexKey {
        let mut buf = Vec::with_capacity(name.len() + value.len() + 1);
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'=');
        buf.extend_from_slice(value.as_bytes());
        IndexKey(buf.into_boxed_slice())
    }

    /// Smallest key carrying the given name.
    pub fn prefix(name: &str) -> IndexKey {
        let mut buf = Vec::with_capacity(name.len() + 1);
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'=');
        IndexKey(buf.into_boxed_slice())
    }

    /// First key past every entry of the given name. `>` is the byte after
    /// `=`.
    pub fn prefix_end(name: &str) -> IndexKey {
        let mut buf = Vec::with_capacity(name.len() + 1);
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'>');
        IndexKey(buf.into_boxed_slice())
    }

    pub fn split(&self) -> Option<(&str, &str)> {
        let s = std::str::from_utf8(&self.0).ok()?;
        s.split_once('=')
    }
}

impl Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Deref for IndexKey {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Decoded, queryable form of one block's index artifact.
///
/// Built once when the artifact is fetched, then shared read-only between all
/// queries that touch the block. Series ordinals are positions in the
/// label-sorted series table; postings bitmaps hold ordinals.
pub struct BlockIndex {
    meta: BlockMeta,
    series: Vec<SeriesEntry>,
    postings: BTreeMap<IndexKey, Bitmap64>,
    all: Bitmap64,
}

impl BlockIndex {
    pub fn new(meta: BlockMeta, series: Vec<SeriesEntry>) -> VaultResult<BlockIndex> {
        meta.validate()?;
        for pair in series.windows(2) {
            if pair[0].labels >= pair[1].labels {
                return Err(VaultError::InvalidBlock(
                    meta.id.to_string(),
                    "series entries out of label order".to_string(),
                ));
            }
        }

        let mut postings: BTreeMap<IndexKey, Bitmap64> = BTreeMap::new();
        let mut all = Bitmap64::new();
        for (ordinal, entry) in series.iter().enumerate() {
            let ordinal = ordinal as u64;
            all.add(ordinal);
            for label in entry.labels.iter() {
                postings
                    .entry(IndexKey::for_label_value(&label.name, &label.value))
                    .or_insert_with(Bitmap64::new)
                    .add(ordinal);
            }
        }

        Ok(BlockIndex {
            meta,
            series,
            postings,
            all,
        })
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    /// Rough resident size, for cache telemetry.
    pub fn approx_size(&self) -> usize {
        let entries: usize = self.series.iter().map(|e| e.get_size()).sum();
        let keys: usize = self.postings.keys().map(|k| k.len()).sum();
        let bitmaps: usize = self
            .postings
            .values()
            .map(|b| b.cardinality() as usize * 8)
            .sum();
        entries + keys + bitmaps
    }

    /// Ordinals of every series satisfying all matchers. No matchers selects
    /// the whole block.
    pub fn postings_for_matchers(&self, matchers: &Matchers) -> Bitmap64 {
        let mut result = self.all.clone();
        for matcher in matchers.iter() {
            if result.is_empty() {
                break;
            }
            result.and_inplace(&self.matcher_postings(matcher));
        }
        result
    }

    /// Series matching every matcher, restricted to chunks overlapping
    /// [start, end]. Entries left without chunks are dropped. Output keeps
    /// ordinal order, which is label order.
    pub fn select(&self, matchers: &Matchers, start: Timestamp, end: Timestamp) -> Vec<SeriesEntry> {
        let postings = self.postings_for_matchers(matchers);
        let mut out = Vec::new();
        for ordinal in postings.iter() {
            let entry = &self.series[ordinal as usize];
            let chunks: Vec<ChunkRef> = entry
                .chunks
                .iter()
                .filter(|c| c.overlaps(start, end))
                .copied()
                .collect();
            if !chunks.is_empty() {
                out.push(SeriesEntry {
                    labels: entry.labels.clone(),
                    chunks,
                });
            }
        }
        out
    }

    fn matcher_postings(&self, matcher: &Matcher) -> Bitmap64 {
        let mut dest = Bitmap64::new();

        if matcher.op == MatchOp::Equal {
            if matcher.value.is_empty() {
                // name="" selects series not carrying the label
                return self.without_name(&matcher.name);
            }
            if let Some(map) = self
                .postings
                .get(&IndexKey::for_label_value(&matcher.name, &matcher.value))
            {
                dest.or_inplace(map);
            }
            return dest;
        }

        let mut with_name = Bitmap64::new();
        for (key, map) in self.name_range(&matcher.name) {
            with_name.or_inplace(map);
            if let Some((_, value)) = key.split() {
                if matcher.matches(value) {
                    dest.or_inplace(map);
                }
            }
        }
        if matcher.matches_empty() {
            // the matcher also accepts series without the label at all
            let mut absent = self.all.clone();
            absent.andnot_inplace(&with_name);
            dest.or_inplace(&absent);
        }
        dest
    }

    fn without_name(&self, name: &str) -> Bitmap64 {
        let mut with_name = Bitmap64::new();
        for (_, map) in self.name_range(name) {
            with_name.or_inplace(map);
        }
        let mut absent = self.all.clone();
        absent.andnot_inplace(&with_name);
        absent
    }

    fn name_range(&self, name: &str) -> impl Iterator<Item = (&IndexKey, &Bitmap64)> {
        self.postings
            .range(IndexKey::prefix(name)..IndexKey::prefix_end(name))
    }
}
