use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::common::{LabelSet, Matchers, Sample, TimeRange, Timestamp};
use crate::error::{VaultError, VaultResult};

/// Read side of the local database an agent fronts: recently scraped samples
/// that have not been shipped yet. Labels are as scraped; external labels are
/// the agent's concern.
pub trait HeadSource: Send + Sync + 'static {
    /// Covered range, `None` while empty.
    fn time_range(&self) -> Option<TimeRange>;

    /// Matching series restricted to `[start, end]`, label-sorted, samples in
    /// timestamp order. Series with no samples in the window are omitted.
    fn select(
        &self,
        matchers: &Matchers,
        start: Timestamp,
        end: Timestamp,
    ) -> VaultResult<Vec<(LabelSet, Vec<Sample>)>>;
}

/// In-memory head window. Backs the tests and single-process agents.
#[derive(Debug, Default)]
pub struct MemHead {
    series: Mutex<BTreeMap<LabelSet, Vec<Sample>>>,
}

impl MemHead {
    pub fn new() -> MemHead {
        MemHead::default()
    }

    /// Appends in timestamp order per series. A sample at the series' current
    /// last timestamp overwrites its value.
    pub fn append(&self, labels: &LabelSet, sample: Sample) -> VaultResult<()> {
        let mut series = self.series.lock().unwrap();
        let samples = series.entry(labels.clone()).or_default();
        match samples.last_mut() {
            Some(last) if sample.timestamp < last.timestamp => Err(
                VaultError::OutOfOrderSample(sample.timestamp, last.timestamp),
            ),
            Some(last) if sample.timestamp == last.timestamp => {
                last.value = sample.value;
                Ok(())
            }
            _ => {
                samples.push(sample);
                Ok(())
            }
        }
    }

    pub fn append_all(&self, labels: &LabelSet, samples: &[Sample]) -> VaultResult<()> {
        for sample in samples {
            self.append(labels, *sample)?;
        }
        Ok(())
    }

    /// Drops samples strictly before `ts`, and series left empty by that.
    /// Called after a block covering them has been shipped.
    pub fn truncate_before(&self, ts: Timestamp) {
        let mut series = self.series.lock().unwrap();
        series.retain(|_, samples| {
            let keep_from = samples.partition_point(|s| s.timestamp < ts);
            samples.drain(..keep_from);
            !samples.is_empty()
        });
    }

    pub fn num_series(&self) -> usize {
        self.series.lock().unwrap().len()
    }
}

impl HeadSource for MemHead {
    fn time_range(&self) -> Option<TimeRange> {
        let series = self.series.lock().unwrap();
        let mut min = Timestamp::MAX;
        let mut max = Timestamp::MIN;
        for samples in series.values() {
            if let (Some(first), Some(last)) = (samples.first(), samples.last()) {
                min = min.min(first.timestamp);
                max = max.max(last.timestamp);
            }
        }
        (min <= max).then_some(TimeRange {
            start: min,
            end: max,
        })
    }

    fn select(
        &self,
        matchers: &Matchers,
        start: Timestamp,
        end: Timestamp,
    ) -> VaultResult<Vec<(LabelSet, Vec<Sample>)>> {
        let series = self.series.lock().unwrap();
        Ok(series
            .iter()
            .filter(|(labels, _)| matchers.matches(labels))
            .filter_map(|(labels, samples)| {
                let lo = samples.partition_point(|s| s.timestamp < start);
                let hi = samples.partition_point(|s| s.timestamp <= end);
                (lo < hi).then(|| (labels.clone(), samples[lo..hi].to_vec()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Matcher;

    fn labels(job: &str) -> LabelSet {
        LabelSet::from_pairs(&[("__name__", "up"), ("job", job)])
    }

    #[test]
    fn test_append_enforces_order_and_overwrites_duplicates() {
        let head = MemHead::new();
        let ls = labels("api");
        head.append(&ls, Sample::new(10, 1.0)).unwrap();
        head.append(&ls, Sample::new(20, 2.0)).unwrap();
        assert!(matches!(
            head.append(&ls, Sample::new(15, 9.0)),
            Err(VaultError::OutOfOrderSample(15, 20))
        ));

        head.append(&ls, Sample::new(20, 3.0)).unwrap();
        let got = head.select(&Matchers::default(), 0, 100).unwrap();
        assert_eq!(got[0].1, vec![Sample::new(10, 1.0), Sample::new(20, 3.0)]);
    }

    #[test]
    fn test_select_filters_by_matchers_and_window() {
        let head = MemHead::new();
        head.append_all(
            &labels("api"),
            &[Sample::new(10, 1.0), Sample::new(20, 2.0), Sample::new(30, 3.0)],
        )
        .unwrap();
        head.append_all(&labels("db"), &[Sample::new(15, 5.0)]).unwrap();

        let api = Matchers::new(vec![Matcher::equal("job", "api")]);
        let got = head.select(&api, 15, 25).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, vec![Sample::new(20, 2.0)]);

        // outside every sample
        assert!(head.select(&api, 100, 200).unwrap().is_empty());

        // everything, label-sorted
        let all = head.select(&Matchers::default(), 0, 100).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].0 < all[1].0);
    }

    #[test]
    fn test_time_range_and_truncate() {
        let head = MemHead::new();
        assert_eq!(head.time_range(), None);

        head.append_all(
            &labels("api"),
            &[Sample::new(10, 1.0), Sample::new(30, 3.0)],
        )
        .unwrap();
        head.append_all(&labels("db"), &[Sample::new(5, 1.0)]).unwrap();
        assert_eq!(head.time_range(), Some(TimeRange { start: 5, end: 30 }));

        head.truncate_before(11);
        assert_eq!(head.time_range(), Some(TimeRange { start: 30, end: 30 }));
        assert_eq!(head.num_series(), 1);

        head.truncate_before(100);
        assert_eq!(head.time_range(), None);
    }
}
