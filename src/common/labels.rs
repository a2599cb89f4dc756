use std::cmp::Ordering;
use std::fmt::Display;

use get_size::GetSize;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// Well-known label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

const SEP: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.name, enquote::enquote('"', &self.value))
    }
}

/// A sorted set of labels with unique names. Identifies one series.
///
/// Ordering is lexicographic over the (name, value) pairs, so a sorted run of
/// label sets is exactly the order endpoints must stream series in.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(GetSize)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup_by(|a, b| a.name == b.name);
        LabelSet(labels)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(n, v)| Label::new(*n, *v))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns a copy with `name` removed. Used to strip the replica label
    /// when grouping series across endpoints.
    pub fn without(&self, name: &str) -> LabelSet {
        LabelSet(
            self.0
                .iter()
                .filter(|l| l.name != name)
                .cloned()
                .collect(),
        )
    }

    /// Compares two label sets as if `skip` were absent from both, without
    /// allocating the stripped copies.
    pub fn cmp_ignoring(&self, other: &LabelSet, skip: &str) -> Ordering {
        let mut a = self.0.iter().filter(|l| l.name != skip);
        let mut b = other.0.iter().filter(|l| l.name != skip);
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => match x.cmp(y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
    }

    pub fn eq_ignoring(&self, other: &LabelSet, skip: &str) -> bool {
        self.cmp_ignoring(other, skip) == Ordering::Equal
    }

    /// Overlays `overrides` onto this set. The override value wins on name
    /// collision; collided names are returned so the caller can report them.
    pub fn with_overrides(&self, overrides: &LabelSet) -> (LabelSet, Vec<String>) {
        let mut collided = Vec::new();
        let mut merged: Vec<Label> = Vec::with_capacity(self.0.len() + overrides.0.len());
        for label in &self.0 {
            if overrides.contains_name(&label.name) {
                collided.push(label.name.clone());
            } else {
                merged.push(label.clone());
            }
        }
        merged.extend(overrides.0.iter().cloned());
        merged.sort();
        (LabelSet(merged), collided)
    }

    /// Stable 64-bit identity over names and values.
    pub fn signature(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&[SEP]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[SEP]);
        }
        hasher.digest()
    }
}

impl Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}")?;
        }
        write!(f, "}}")
    }
}

impl From<Vec<Label>> for LabelSet {
    fn from(labels: Vec<Label>) -> Self {
        LabelSet::new(labels)
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        LabelSet::from_pairs(pairs)
    }

    #[test]
    fn test_new_sorts_and_dedups_names() {
        let set = LabelSet::new(vec![
            Label::new("job", "api"),
            Label::new("az", "eu-1"),
            Label::new("job", "ignored"),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("job"), Some("api"));
        assert_eq!(set.get("az"), Some("eu-1"));
        assert_eq!(set.get("missing"), None);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = labels(&[("job", "api")]);
        let b = labels(&[("job", "api"), ("replica", "a")]);
        let c = labels(&[("job", "web")]);
        assert!(a < b, "prefix sorts first");
        assert!(b < c);
    }

    #[test]
    fn test_cmp_ignoring_replica_label() {
        let a = labels(&[("job", "x"), ("replica", "a")]);
        let b = labels(&[("job", "x"), ("replica", "b")]);
        let c = labels(&[("job", "y"), ("replica", "a")]);

        assert_eq!(a.cmp_ignoring(&b, "replica"), Ordering::Equal);
        assert!(a.eq_ignoring(&b, "replica"));
        assert_eq!(a.cmp_ignoring(&c, "replica"), Ordering::Less);
        // ignoring an unrelated name keeps the full comparison
        assert_eq!(a.cmp_ignoring(&b, "job"), Ordering::Less);
    }

    #[test]
    fn test_without() {
        let a = labels(&[("job", "x"), ("replica", "a")]);
        assert_eq!(a.without("replica"), labels(&[("job", "x")]));
        assert_eq!(a.without("nope"), a);
    }

    #[test]
    fn test_with_overrides_reports_collisions() {
        let stored = labels(&[("job", "x"), ("replica", "local")]);
        let external = labels(&[("replica", "a"), ("region", "eu")]);
        let (merged, collided) = stored.with_overrides(&external);
        assert_eq!(
            merged,
            labels(&[("job", "x"), ("replica", "a"), ("region", "eu")])
        );
        assert_eq!(collided, vec!["replica".to_string()]);
    }

    #[test]
    fn test_signature_distinguishes_boundaries() {
        // "ab"+"c" must not collide with "a"+"bc"
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), labels(&[("ab", "c")]).signature());
    }

    #[test]
    fn test_display() {
        let a = labels(&[("job", "x"), ("path", "a\"b")]);
        assert_eq!(a.to_string(), r#"{job="x", path="a\"b"}"#);
        assert_eq!(LabelSet::default().to_string(), "{}");
    }
}
