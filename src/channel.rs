//! Channels — `/`-separated path identifiers and the subscription-pattern
//! matcher layered on top of them.
//!
//! A channel carries no schema; it exists implicitly the moment something
//! publishes or subscribes to it. Patterns add two wildcards: `*` matches
//! exactly one segment, and a trailing `/**` matches one or more trailing
//! segments. `**` anywhere but the final position is rejected at parse
//! time — there is no mid-path subtree wildcard.

use crate::error::RaceError;

/// An immutable, `/`-separated channel identifier (e.g. `/flights/positions`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    pub fn new(path: impl Into<String>) -> Self {
        Channel(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// A channel is strictly in-process when it starts with `/local/`.
    pub fn is_local(&self) -> bool {
        self.0.starts_with("/local/") || self.0 == "/local"
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Channel::new(s)
    }
}

impl From<String> for Channel {
    fn from(s: String) -> Self {
        Channel::new(s)
    }
}

/// A subscription pattern: a channel path with optional wildcard segments.
///
/// Validated once at construction so matching never has to re-check grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    /// `*` — matches exactly one non-empty segment.
    Single,
    /// `**` — only legal as the final segment; matches one or more
    /// remaining segments.
    Subtree,
}

impl Pattern {
    pub fn parse(raw: impl Into<String>) -> Result<Self, RaceError> {
        let raw = raw.into();
        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();

        if parts.is_empty() {
            return Err(RaceError::InvalidPattern {
                pattern: raw,
                reason: "pattern must have at least one segment".into(),
            });
        }

        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let is_last = i == parts.len() - 1;
            let seg = match *part {
                "**" if is_last => Segment::Subtree,
                "**" => {
                    return Err(RaceError::InvalidPattern {
                        pattern: raw.clone(),
                        reason: "`**` is only allowed as the final segment".into(),
                    });
                }
                "*" => Segment::Single,
                lit => Segment::Literal(lit.to_string()),
            };
            segments.push(seg);
        }

        Ok(Pattern { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `channel` matches this pattern, segment by segment.
    pub fn matches(&self, channel: &Channel) -> bool {
        let chan_segs: Vec<&str> = channel.segments().collect();

        let mut ci = 0usize;
        for (pi, seg) in self.segments.iter().enumerate() {
            match seg {
                Segment::Subtree => {
                    // Must be the last pattern segment (enforced at parse
                    // time); matches one or more remaining channel segments.
                    return ci < chan_segs.len();
                }
                Segment::Single => {
                    if ci >= chan_segs.len() {
                        return false;
                    }
                    ci += 1;
                }
                Segment::Literal(lit) => {
                    if chan_segs.get(ci) != Some(&lit.as_str()) {
                        return false;
                    }
                    ci += 1;
                }
            }
            let _ = pi;
        }

        // All pattern segments consumed with no subtree wildcard: exact
        // segment-count match required.
        ci == chan_segs.len()
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
