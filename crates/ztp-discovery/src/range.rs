//! Range specification expansion
//!
//! A specification is a comma-separated list of segments, each either a
//! single address (`10.0.0.5`) or an inclusive pair (`10.0.0.1-10.0.0.40`).
//! Malformed segments are skipped. The result keeps first-seen order and has
//! no duplicates.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest number of targets a single pass may cover
pub const MAX_TARGETS: usize = 1500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Range '{0}' contains no valid addresses")]
    Empty(String),
    #[error("Range expands to {count} addresses, more than the limit of {limit}; narrow the range")]
    TooLarge { count: usize, limit: usize },
}

/// One parsed segment, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl Segment {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once('-') {
            Some((start, end)) => {
                let start = Ipv4Addr::from_str(start.trim()).ok()?;
                let end = Ipv4Addr::from_str(end.trim()).ok()?;
                Some(Self { start, end })
            }
            None => {
                let ip = Ipv4Addr::from_str(raw).ok()?;
                Some(Self { start: ip, end: ip })
            }
        }
    }

    fn same_slash24(&self) -> bool {
        self.start.octets()[..3] == self.end.octets()[..3]
    }

    /// Number of addresses the segment covers (0 if reversed)
    fn span(&self) -> u64 {
        let (start, end) = (u32::from(self.start), u32::from(self.end));
        if end < start {
            0
        } else {
            u64::from(end - start) + 1
        }
    }

    fn addresses(&self) -> Box<dyn Iterator<Item = Ipv4Addr>> {
        if self.same_slash24() {
            let [a, b, c, first] = self.start.octets();
            let last = self.end.octets()[3];
            Box::new((first..=last).map(move |d| Ipv4Addr::new(a, b, c, d)))
        } else {
            let (start, end) = (u32::from(self.start), u32::from(self.end));
            Box::new((start..=end).map(Ipv4Addr::from))
        }
    }
}

/// Expand a range specification into a bounded, deduplicated target list
pub fn expand_range(spec: &str) -> Result<Vec<Ipv4Addr>, RangeError> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for raw in spec.split(',') {
        let Some(segment) = Segment::parse(raw) else {
            if !raw.trim().is_empty() {
                warn!(segment = %raw.trim(), "Skipping malformed range segment");
            }
            continue;
        };

        let span = segment.span();
        if span == 0 {
            warn!(segment = %raw.trim(), "Skipping reversed range segment");
            continue;
        }
        // A single segment over the cap can never dedup below it
        if span > MAX_TARGETS as u64 {
            return Err(RangeError::TooLarge {
                count: usize::try_from(span).unwrap_or(usize::MAX),
                limit: MAX_TARGETS,
            });
        }

        for ip in segment.addresses() {
            if seen.insert(ip) {
                targets.push(ip);
            }
        }
        if targets.len() > MAX_TARGETS {
            return Err(RangeError::TooLarge {
                count: targets.len(),
                limit: MAX_TARGETS,
            });
        }
    }

    if targets.is_empty() {
        return Err(RangeError::Empty(spec.to_string()));
    }

    debug!(count = targets.len(), spec = %spec, "Expanded range");
    Ok(targets)
}
