use std::fmt::Display;

use phf::phf_map;
use regex::Regex;

use crate::common::labels::{LabelSet, METRIC_NAME_LABEL};
use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

pub static MATCH_OPS_MAP: phf::Map<&'static str, MatchOp> = phf_map! {
    "=" => MatchOp::Equal,
    "!=" => MatchOp::NotEqual,
    "=~" => MatchOp::Regex,
    "!~" => MatchOp::NotRegex,
};

impl MatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        }
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, MatchOp::NotEqual | MatchOp::NotRegex)
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, MatchOp::Regex | MatchOp::NotRegex)
    }
}

impl Display for MatchOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One label condition of a series selector.
///
/// A regex whose pattern contains no metacharacters is evaluated as a plain
/// equality so the common `=~"literal"` case never hits the regex engine.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> VaultResult<Self> {
        let name = name.into();
        let value = value.into();
        let re = if op.is_regex() && !is_literal(&value) {
            // Selector regexes are anchored to the full value.
            let pattern = format!("^(?:{value})$");
            Some(Regex::new(&pattern).map_err(|e| {
                VaultError::InvalidSeriesSelector(format!("bad regex {value:?}: {e}"))
            })?)
        } else {
            None
        };
        Ok(Matcher { name, op, value, re })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            re: None,
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
            re: None,
        }
    }

    pub fn regex(name: impl Into<String>, value: impl Into<String>) -> VaultResult<Self> {
        Matcher::new(MatchOp::Regex, name, value)
    }

    pub fn not_regex(name: impl Into<String>, value: impl Into<String>) -> VaultResult<Self> {
        Matcher::new(MatchOp::NotRegex, name, value)
    }

    /// Matches the value this series carries for `self.name`. An absent label
    /// is treated as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Equal => value == self.value,
            MatchOp::NotEqual => value != self.value,
            MatchOp::Regex => self.matches_regex(value),
            MatchOp::NotRegex => !self.matches_regex(value),
        }
    }

    fn matches_regex(&self, value: &str) -> bool {
        match &self.re {
            Some(re) => re.is_match(value),
            None => value == self.value,
        }
    }

    /// True when matching the empty string, i.e. the matcher also accepts
    /// series that do not carry the label at all.
    pub fn matches_empty(&self) -> bool {
        self.matches("")
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl Eq for Matcher {}

impl Display for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.name,
            self.op,
            enquote::enquote('"', &self.value)
        )
    }
}

/// The AND of a set of matchers; what one `Series` call selects on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Matchers(pub Vec<Matcher>);

impl Matchers {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Matchers(matchers)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Matcher> {
        self.0.iter()
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.0
            .iter()
            .all(|m| m.matches(labels.get(&m.name).unwrap_or("")))
    }

    /// Pruning test against an endpoint's advertised label set: a matcher on
    /// a name the set does not carry cannot rule the endpoint out, because
    /// stored series can hold labels the advertisement omits.
    pub fn could_match(&self, advertised: &LabelSet) -> bool {
        self.0.iter().all(|m| match advertised.get(&m.name) {
            Some(value) => m.matches(value),
            None => true,
        })
    }
}

impl Display for Matchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{m}")?;
        }
        write!(f, "}}")
    }
}

impl From<Vec<Matcher>> for Matchers {
    fn from(matchers: Vec<Matcher>) -> Self {
        Matchers(matchers)
    }
}

/// True when `pattern` contains no regex metacharacters and can be compared
/// byte for byte.
fn is_literal(pattern: &str) -> bool {
    !pattern.chars().any(regex_syntax::is_meta_character)
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit()
}

/// Parses the standard selector notation, e.g. `up{job="api",az=~"eu-.*"}`.
/// A bare metric name becomes an equality matcher on `__name__`.
pub fn parse_selector(input: &str) -> VaultResult<Matchers> {
    let err = |msg: &str| VaultError::InvalidSeriesSelector(format!("{msg} in {input:?}"));

    let s = input.trim();
    let (metric, rest) = match s.find('{') {
        Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
        None => (s, None),
    };

    let mut matchers = Vec::new();
    let metric = metric.trim();
    if !metric.is_empty() {
        if !metric.starts_with(is_name_start) || !metric.chars().all(is_name_char) {
            return Err(err("invalid metric name"));
        }
        matchers.push(Matcher::equal(METRIC_NAME_LABEL, metric));
    }

    let Some(mut rest) = rest else {
        if matchers.is_empty() {
            return Err(err("empty selector"));
        }
        return Ok(Matchers(matchers));
    };

    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('}') {
            if !after.trim().is_empty() {
                return Err(err("trailing input after '}'"));
            }
            return Ok(Matchers(matchers));
        }

        let name_len = rest.chars().take_while(|&c| is_name_char(c)).count();
        if name_len == 0 || !rest.starts_with(is_name_start) {
            return Err(err("expected label name"));
        }
        let name = &rest[..name_len];
        rest = rest[name_len..].trim_start();

        // Two-character operators first so `!=` is not read as `!`.
        let op = MATCH_OPS_MAP
            .get(rest.get(..2).unwrap_or(""))
            .or_else(|| MATCH_OPS_MAP.get(rest.get(..1).unwrap_or("")))
            .copied()
            .ok_or_else(|| err("expected one of =, !=, =~, !~"))?;
        rest = rest[op.as_str().len()..].trim_start();

        let quoted_len = quoted_token_len(rest).ok_or_else(|| err("expected quoted value"))?;
        let value = enquote::unquote(&rest[..quoted_len])
            .map_err(|e| err(&format!("bad quoting: {e}")))?;
        rest = rest[quoted_len..].trim_start();

        matchers.push(Matcher::new(op, name, value)?);

        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma;
        } else if !rest.starts_with('}') {
            return Err(err("expected ',' or '}'"));
        }
    }
}

/// Length in bytes of the leading `"..."` token, escapes included.
fn quoted_token_len(s: &str) -> Option<usize> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, '"')) => {}
        _ => return None,
    }
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(i + 1);
        }
    }
    None
}
