use std::cmp::Ordering;

use crate::common::{Sample, Timestamp};

/// The decoded samples of one chunk, in timestamp order. Never empty.
#[derive(Debug, Clone)]
pub struct Segment {
    samples: Vec<Sample>,
}

impl Segment {
    pub fn new(samples: Vec<Sample>) -> Option<Segment> {
        if samples.is_empty() {
            None
        } else {
            Some(Segment { samples })
        }
    }

    pub fn min_time(&self) -> Timestamp {
        self.samples[0].timestamp
    }

    pub fn max_time(&self) -> Timestamp {
        self.samples[self.samples.len() - 1].timestamp
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Everything one replica contributed to a merge group: its segments from
/// all sources, sorted by time.
#[derive(Debug)]
pub struct ReplicaRun {
    /// Value of the replica label, empty when the series carried none.
    pub replica: String,

    /// Position of the first contributing source in dispatch order. Only
    /// used as the last tie-break.
    pub ordinal: usize,

    pub segments: Vec<Segment>,
}

impl ReplicaRun {
    pub fn new(replica: impl Into<String>, ordinal: usize, mut segments: Vec<Segment>) -> ReplicaRun {
        segments.sort_by_key(|s| (s.min_time(), s.max_time()));
        ReplicaRun {
            replica: replica.into(),
            ordinal,
            segments,
        }
    }
}

/// What a preference policy gets to see when replicas compete for the next
/// window: one pending segment per replica, plus where the walk stands.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCandidate<'a> {
    pub replica: &'a str,
    pub ordinal: usize,

    /// This replica supplied the previously emitted segment.
    pub active: bool,

    /// Start of the pending segment.
    pub start: Timestamp,

    /// Milliseconds between the last emitted sample and `start`. Zero when
    /// the segment begins at or before the emitted frontier, or when nothing
    /// has been emitted yet.
    pub gap: i64,
}

/// Picks which replica serves the next window of a deduplicated series.
///
/// `Less` means the left candidate wins. Implementations must induce a total
/// order over candidates for any fixed walk state; the walk output is then
/// deterministic regardless of which endpoint answered first.
pub trait ReplicaPreference: Send + Sync + 'static {
    fn compare(&self, a: &SegmentCandidate<'_>, b: &SegmentCandidate<'_>) -> Ordering;
}

/// Default policy. Smallest coverage gap first, so switching replicas never
/// loses samples another replica still has. On equal gaps the active replica
/// keeps serving, which minimizes switches. Remaining ties fall through to
/// segment start, replica label value, and finally source order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuityPreference;

impl ReplicaPreference for ContinuityPreference {
    fn compare(&self, a: &SegmentCandidate<'_>, b: &SegmentCandidate<'_>) -> Ordering {
        a.gap
            .cmp(&b.gap)
            .then_with(|| b.active.cmp(&a.active))
            .then_with(|| a.start.cmp(&b.start))
            .then_with(|| a.replica.cmp(b.replica))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    }
}

/// Collapses the replicas of one logical series into a single sample
/// sequence with strictly increasing timestamps.
///
/// The walk goes segment by segment. Each round drops segments that end at
/// or before the emitted frontier, asks the preference which replica serves
/// next, emits that whole segment (minus any prefix the frontier already
/// covers) and moves the frontier to its end. A segment is never split to
/// jump to another replica mid-window.
pub fn dedup_samples(runs: &[ReplicaRun], preference: &dyn ReplicaPreference) -> Vec<Sample> {
    let total: usize = runs.iter().map(|r| r.segments.iter().map(|s| s.samples.len()).sum::<usize>()).sum();
    let mut out = Vec::with_capacity(total);

    let mut cursors = vec![0usize; runs.len()];
    let mut active: Option<usize> = None;
    let mut frontier = Timestamp::MIN;
    let mut started = false;

    loop {
        for (i, run) in runs.iter().enumerate() {
            while cursors[i] < run.segments.len() && run.segments[cursors[i]].max_time() <= frontier
            {
                cursors[i] += 1;
            }
        }

        let mut winner: Option<usize> = None;
        for i in 0..runs.len() {
            if cursors[i] >= runs[i].segments.len() {
                continue;
            }
            winner = match winner {
                None => Some(i),
                Some(w) => {
                    let a = candidate(&runs[i], cursors[i], active == Some(i), frontier, started);
                    let b = candidate(&runs[w], cursors[w], active == Some(w), frontier, started);
                    if preference.compare(&a, &b) == Ordering::Less {
                        Some(i)
                    } else {
                        Some(w)
                    }
                }
            };
        }
        let Some(w) = winner else {
            break;
        };

        let segment = &runs[w].segments[cursors[w]];
        for sample in segment.samples() {
            if !started || sample.timestamp > frontier {
                out.push(*sample);
                frontier = sample.timestamp;
                started = true;
            }
        }
        // The loop above skips every sample of a segment that only holds
        // duplicate timestamps; the frontier still has to move past it.
        frontier = frontier.max(segment.max_time());
        cursors[w] += 1;
        active = Some(w);
    }

    out
}

fn candidate<'a>(
    run: &'a ReplicaRun,
    cursor: usize,
    active: bool,
    frontier: Timestamp,
    started: bool,
) -> SegmentCandidate<'a> {
    let start = run.segments[cursor].min_time();
    let gap = if started {
        (start - frontier).max(0)
    } else {
        0
    };
    SegmentCandidate {
        replica: &run.replica,
        ordinal: run.ordinal,
        active,
        start,
        gap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(points: &[(i64, f64)]) -> Segment {
        let samples = points
            .iter()
            .map(|(t, v)| Sample::new(*t, *v))
            .collect::<Vec<_>>();
        Segment::new(samples).unwrap()
    }

    fn samples_of(points: &[(i64, f64)]) -> Vec<Sample> {
        points.iter().map(|(t, v)| Sample::new(*t, *v)).collect()
    }

    fn assert_strictly_increasing(samples: &[Sample]) {
        for pair in samples.windows(2) {
            assert!(
                pair[0].timestamp < pair[1].timestamp,
                "{} then {}",
                pair[0].timestamp,
                pair[1].timestamp
            );
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(dedup_samples(&[], &ContinuityPreference).is_empty());
    }

    #[test]
    fn test_single_replica_concatenates_segments() {
        let run = ReplicaRun::new(
            "a",
            0,
            vec![segment(&[(0, 1.0), (10, 2.0)]), segment(&[(20, 3.0)])],
        );
        let out = dedup_samples(&[run], &ContinuityPreference);
        assert_eq!(out, samples_of(&[(0, 1.0), (10, 2.0), (20, 3.0)]));
    }

    #[test]
    fn test_identical_replicas_collapse_to_one_copy() {
        let points = [(0, 1.0), (10, 2.0), (20, 3.0)];
        let a = ReplicaRun::new("a", 0, vec![segment(&points)]);
        let b = ReplicaRun::new("b", 1, vec![segment(&points)]);
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        assert_eq!(out, samples_of(&points));
        assert_strictly_increasing(&out);
    }

    #[test]
    fn test_staggered_replicas_union_without_duplicates() {
        let a = ReplicaRun::new("a", 0, vec![segment(&[(0, 1.0), (10, 2.0), (20, 3.0)])]);
        let b = ReplicaRun::new("b", 1, vec![segment(&[(10, 2.0), (20, 3.0), (30, 4.0)])]);
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        assert_eq!(out, samples_of(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]));
    }

    #[test]
    fn test_never_interleaves_within_an_overlap() {
        // b's samples sit between a's, all inside one overlapping window.
        // A merge that interleaved would produce values from both.
        let a = ReplicaRun::new(
            "a",
            0,
            vec![segment(&[(0, 1.0), (10, 1.0), (20, 1.0), (30, 1.0)])],
        );
        let b = ReplicaRun::new("b", 1, vec![segment(&[(5, 2.0), (15, 2.0), (25, 2.0)])]);
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        assert!(out.iter().all(|s| s.value == 1.0), "{:?}", out);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_switches_replica_to_cover_a_gap() {
        // a has a hole from 100 to 200; b covers 90..210. The walk must
        // serve the hole from b and come back to a afterwards.
        let a = ReplicaRun::new(
            "a",
            0,
            vec![
                segment(&[(0, 1.0), (50, 1.0), (100, 1.0)]),
                segment(&[(200, 1.0), (250, 1.0), (300, 1.0)]),
            ],
        );
        let b = ReplicaRun::new("b", 1, vec![segment(&[(90, 2.0), (150, 2.0), (210, 2.0)])]);
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        assert_eq!(
            out,
            samples_of(&[
                (0, 1.0),
                (50, 1.0),
                (100, 1.0),
                (150, 2.0),
                (210, 2.0),
                (250, 1.0),
                (300, 1.0),
            ])
        );
        assert_strictly_increasing(&out);
    }

    #[test]
    fn test_active_replica_keeps_serving_on_equal_gaps() {
        let a = ReplicaRun::new(
            "a",
            0,
            vec![segment(&[(0, 1.0), (10, 1.0)]), segment(&[(30, 1.0), (40, 1.0)])],
        );
        let b = ReplicaRun::new(
            "b",
            1,
            vec![segment(&[(0, 2.0), (10, 2.0)]), segment(&[(30, 2.0), (40, 2.0)])],
        );
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        // first round falls through to the replica value, afterwards the
        // active replica wins every tie
        assert!(out.iter().all(|s| s.value == 1.0), "{:?}", out);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_same_replica_from_two_sources_drops_covered_segments() {
        // Two sources serving the same replica, one lagging behind the
        // other. The overlap must collapse instead of duplicating.
        let run = ReplicaRun::new(
            "a",
            0,
            vec![
                segment(&[(0, 1.0), (10, 2.0), (20, 3.0)]),
                segment(&[(10, 2.0), (20, 3.0), (30, 4.0)]),
            ],
        );
        let out = dedup_samples(&[run], &ContinuityPreference);
        assert_eq!(out, samples_of(&[(0, 1.0), (10, 2.0), (20, 3.0), (30, 4.0)]));
    }

    #[test]
    fn test_output_gap_never_wider_than_best_replica() {
        let a = ReplicaRun::new(
            "a",
            0,
            vec![segment(&[(0, 1.0), (100, 1.0)]), segment(&[(400, 1.0), (500, 1.0)])],
        );
        let b = ReplicaRun::new("b", 1, vec![segment(&[(150, 2.0), (250, 2.0)])]);
        let out = dedup_samples(&[a, b], &ContinuityPreference);
        assert_eq!(
            out,
            samples_of(&[(0, 1.0), (100, 1.0), (150, 2.0), (250, 2.0), (400, 1.0), (500, 1.0)])
        );
        let widest = out
            .windows(2)
            .map(|p| p[1].timestamp - p[0].timestamp)
            .max()
            .unwrap();
        assert_eq!(widest, 150);
    }

    #[test]
    fn test_preference_orders_by_gap_before_activity() {
        let pref = ContinuityPreference;
        let near = SegmentCandidate {
            replica: "b",
            ordinal: 1,
            active: false,
            start: 105,
            gap: 5,
        };
        let far = SegmentCandidate {
            replica: "a",
            ordinal: 0,
            active: true,
            start: 200,
            gap: 100,
        };
        assert_eq!(pref.compare(&near, &far), Ordering::Less);
        assert_eq!(pref.compare(&far, &near), Ordering::Greater);
    }

    #[test]
    fn test_preference_prefers_active_then_replica_value() {
        let pref = ContinuityPreference;
        let active = SegmentCandidate {
            replica: "b",
            ordinal: 1,
            active: true,
            start: 100,
            gap: 0,
        };
        let idle = SegmentCandidate {
            replica: "a",
            ordinal: 0,
            active: false,
            start: 100,
            gap: 0,
        };
        assert_eq!(pref.compare(&active, &idle), Ordering::Less);

        let idle_b = SegmentCandidate { active: false, ..active };
        assert_eq!(pref.compare(&idle, &idle_b), Ordering::Less, "a before b");
        assert_eq!(pref.compare(&idle, &idle), Ordering::Equal);
    }
}
