use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use min_max_heap::MinMaxHeap;
use smallvec::SmallVec;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunkenc::ChunkData;
use crate::common::{LabelSet, Sample};
use crate::error::{VaultError, VaultResult};
use crate::query::dedup::{dedup_samples, ReplicaPreference, ReplicaRun, Segment};
use crate::query::fanout::EndpointFeed;
use crate::store::{RawSeries, SeriesFrame, Warning};

/// One merged logical series: labels with the replica label removed, samples
/// deduplicated across all replicas that contributed. Empty samples when the
/// request skipped chunk payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

/// Everything a fully drained query produced.
#[derive(Debug)]
pub struct QueryOutcome {
    pub series: Vec<MergedSeries>,
    pub warnings: Vec<Warning>,
}

pub(crate) struct MergeParams {
    pub(crate) replica_label: String,
    pub(crate) require_all: bool,
    pub(crate) skip_chunks: bool,
    pub(crate) preference: Arc<dyn ReplicaPreference>,
    pub(crate) deadline: Instant,
    pub(crate) budget: Duration,
    pub(crate) cancel: CancellationToken,
}

/// Reads one endpoint's feed in order. Diverts warning frames, verifies the
/// label ordering contract, and turns an endpoint failure into either a
/// warning or an abort depending on `require_all`.
struct SourceCursor {
    name: String,
    rx: tokio::sync::mpsc::Receiver<VaultResult<SeriesFrame>>,
    last_labels: Option<LabelSet>,
    exhausted: bool,
}

impl SourceCursor {
    async fn pull(
        &mut self,
        require_all: bool,
        warnings: &mut Vec<Warning>,
    ) -> VaultResult<Option<RawSeries>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            match self.rx.recv().await {
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
                Some(Ok(SeriesFrame::Warning(warning))) => warnings.push(warning),
                Some(Ok(SeriesFrame::Series(series))) => {
                    if let Some(previous) = &self.last_labels {
                        if *previous >= series.labels {
                            self.exhausted = true;
                            let err = VaultError::OutOfOrderSeries(
                                series.labels.to_string(),
                                previous.to_string(),
                            );
                            if require_all {
                                return Err(VaultError::EndpointFailure(
                                    self.name.clone(),
                                    err.to_string(),
                                ));
                            }
                            warnings.push(Warning::new(&self.name, err.to_string()));
                            return Ok(None);
                        }
                    }
                    self.last_labels = Some(series.labels.clone());
                    return Ok(Some(series));
                }
                Some(Err(err)) => {
                    self.exhausted = true;
                    // Cancellation is never degraded to a warning; the whole
                    // query is being torn down.
                    if matches!(err, VaultError::Cancelled) {
                        return Err(err);
                    }
                    if require_all {
                        return Err(match err {
                            timeout @ VaultError::DeadlineExceeded(_, _) => timeout,
                            other => {
                                VaultError::EndpointFailure(self.name.clone(), other.to_string())
                            }
                        });
                    }
                    warnings.push(Warning::new(&self.name, err.to_string()));
                    return Ok(None);
                }
            }
        }
    }
}

/// One source's lookahead series, keyed for the merge order: stripped label
/// set first, full label set to break ties, source position last.
struct HeapEntry {
    stripped: LabelSet,
    replica: String,
    ordinal: usize,
    series: RawSeries,
}

impl HeapEntry {
    fn new(series: RawSeries, replica_label: &str, ordinal: usize) -> HeapEntry {
        let stripped = series.labels.without(replica_label);
        let replica = series.labels.get(replica_label).unwrap_or("").to_string();
        HeapEntry {
            stripped,
            replica,
            ordinal,
            series,
        }
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stripped
            .cmp(&other.stripped)
            .then_with(|| self.series.labels.cmp(&other.series.labels))
            .then_with(|| self.ordinal.cmp(&other.ordinal))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// K-way merge over all endpoint feeds, deduplicating replicas as groups
/// complete.
///
/// The heap holds at most one lookahead series per source, so memory stays
/// proportional to the endpoint count no matter how many series flow
/// through. Output order is total: lexicographic by replica-stripped label
/// set, ties by full label set, then source position. Dropping the stream
/// cancels whatever is still in flight.
pub struct MergedStream {
    cursors: Vec<SourceCursor>,
    heap: MinMaxHeap<HeapEntry>,
    warnings: Vec<Warning>,
    replica_label: String,
    require_all: bool,
    skip_chunks: bool,
    preference: Arc<dyn ReplicaPreference>,
    deadline: Instant,
    budget: Duration,
    cancel: CancellationToken,
    primed: bool,
    done: bool,
}

impl std::fmt::Debug for MergedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedStream")
            .field("replica_label", &self.replica_label)
            .field("require_all", &self.require_all)
            .field("skip_chunks", &self.skip_chunks)
            .field("primed", &self.primed)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl MergedStream {
    pub(crate) fn new(mut feeds: Vec<EndpointFeed>, params: MergeParams) -> MergedStream {
        feeds.sort_by_key(|feed| feed.ordinal);
        let cursors: Vec<SourceCursor> = feeds
            .into_iter()
            .map(|feed| SourceCursor {
                name: feed.name,
                rx: feed.rx,
                last_labels: None,
                exhausted: false,
            })
            .collect();
        MergedStream {
            heap: MinMaxHeap::with_capacity(cursors.len()),
            cursors,
            warnings: Vec::new(),
            replica_label: params.replica_label,
            require_all: params.require_all,
            skip_chunks: params.skip_chunks,
            preference: params.preference,
            deadline: params.deadline,
            budget: params.budget,
            cancel: params.cancel,
            primed: false,
            done: false,
        }
    }

    /// Next merged series in output order, `None` when every source is
    /// drained. After an error the stream is finished and everything still
    /// in flight is cancelled.
    pub async fn next_series(&mut self) -> VaultResult<Option<MergedSeries>> {
        if self.done {
            return Ok(None);
        }
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let budget = self.budget;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VaultError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                Err(VaultError::DeadlineExceeded("query".to_string(), budget))
            }
            group = self.next_group() => group,
        };
        match result {
            Ok(Some(series)) => Ok(Some(series)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(err) => {
                self.done = true;
                self.cancel.cancel();
                Err(err)
            }
        }
    }

    /// Warnings accumulated so far. Grows as the merge advances.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    /// Drains the whole stream.
    pub async fn collect(mut self) -> VaultResult<QueryOutcome> {
        let mut series = Vec::new();
        while let Some(next) = self.next_series().await? {
            series.push(next);
        }
        tracing::debug!(
            "query merged {} series with {} warnings",
            series.len(),
            self.warnings.len()
        );
        Ok(QueryOutcome {
            series,
            warnings: self.take_warnings(),
        })
    }

    async fn next_group(&mut self) -> VaultResult<Option<MergedSeries>> {
        if !self.primed {
            self.primed = true;
            for index in 0..self.cursors.len() {
                self.refill(index).await?;
            }
        }

        let Some(first) = self.heap.pop_min() else {
            return Ok(None);
        };
        let first_ordinal = first.ordinal;
        let mut group: SmallVec<HeapEntry, 4> = SmallVec::new();
        group.push(first);
        self.refill(first_ordinal).await?;

        // Gather every lookahead with the same stripped labels, refilling
        // after each pop: the same source can hold further replicas of this
        // group right behind the one we just took.
        loop {
            let same_group = match self.heap.peek_min() {
                Some(peek) => peek.stripped == group[0].stripped,
                None => false,
            };
            if !same_group {
                break;
            }
            let Some(entry) = self.heap.pop_min() else {
                break;
            };
            let ordinal = entry.ordinal;
            group.push(entry);
            self.refill(ordinal).await?;
        }

        let labels = group[0].stripped.clone();
        let samples = if self.skip_chunks {
            Vec::new()
        } else if group.len() == 1 {
            self.decode_passthrough(&group[0])
        } else {
            self.dedup_group(&group)
        };
        Ok(Some(MergedSeries { labels, samples }))
    }

    async fn refill(&mut self, index: usize) -> VaultResult<()> {
        let require_all = self.require_all;
        let cursor = &mut self.cursors[index];
        if let Some(series) = cursor.pull(require_all, &mut self.warnings).await? {
            self.heap
                .push(HeapEntry::new(series, &self.replica_label, index));
        }
        Ok(())
    }

    /// A group with a single contributing series keeps its samples exactly
    /// as the source sent them.
    fn decode_passthrough(&mut self, entry: &HeapEntry) -> Vec<Sample> {
        let mut samples = Vec::new();
        for chunk in &entry.series.chunks {
            match decode_chunk(chunk) {
                Ok(mut decoded) => samples.append(&mut decoded),
                Err(err) => self.warn_undecodable(entry, err),
            }
        }
        samples
    }

    fn dedup_group(&mut self, group: &[HeapEntry]) -> Vec<Sample> {
        let mut by_replica: BTreeMap<&str, (usize, Vec<Segment>)> = BTreeMap::new();
        for entry in group {
            let slot = by_replica
                .entry(entry.replica.as_str())
                .or_insert_with(|| (entry.ordinal, Vec::new()));
            for chunk in &entry.series.chunks {
                match decode_chunk(chunk) {
                    Ok(samples) => {
                        if let Some(segment) = Segment::new(samples) {
                            slot.1.push(segment);
                        }
                    }
                    Err(err) => self.warn_undecodable(entry, err),
                }
            }
        }

        let runs: Vec<ReplicaRun> = by_replica
            .into_iter()
            .map(|(replica, (ordinal, segments))| ReplicaRun::new(replica, ordinal, segments))
            .collect();
        dedup_samples(&runs, self.preference.as_ref())
    }

    fn warn_undecodable(&mut self, entry: &HeapEntry, err: VaultError) {
        let origin = self.cursors[entry.ordinal].name.clone();
        self.warnings.push(Warning::new(
            origin,
            format!("undecodable chunk in {}: {}", entry.series.labels, err),
        ));
    }
}

impl Drop for MergedStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn decode_chunk(chunk: &ChunkData) -> VaultResult<Vec<Sample>> {
    chunk.iter()?.collect()
}
