pub mod encoding;
pub mod labels;
pub mod matchers;
pub mod types;

pub use encoding::*;
pub use labels::{Label, LabelSet, METRIC_NAME_LABEL};
pub use matchers::{parse_selector, MatchOp, Matcher, Matchers};
pub use types::{fmt_timestamp, Sample, TimeRange, Timestamp};
