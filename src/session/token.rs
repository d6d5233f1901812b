//! Vector session token: one partition's version progress.
//!
//! Wire format: `<version>#<globalLsn>[#<regionId>=<localLsn>...]`. A bare
//! `<globalLsn>` (legacy single-LSN token) is accepted and reads as version 0.

use crate::error::SessionTokenError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const SEGMENT_SEPARATOR: char = '#';
const REGION_SEPARATOR: char = '=';

/// Region identifier inside a vector session token.
pub type RegionId = u32;

/// Immutable per-partition consistency watermark.
///
/// Tokens only ever grow through [`SessionToken::merge`]. Ordering between
/// tokens is partial: see [`SessionToken::is_as_recent_as`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken {
    version: u64,
    global_lsn: u64,
    region_progress: BTreeMap<RegionId, u64>,
}

impl SessionToken {
    /// Build a token from its parts.
    pub fn new(
        version: u64,
        global_lsn: u64,
        region_progress: impl IntoIterator<Item = (RegionId, u64)>,
    ) -> Self {
        Self {
            version,
            global_lsn,
            region_progress: region_progress.into_iter().collect(),
        }
    }

    /// Parse the wire representation.
    pub fn parse(text: &str) -> Result<Self, SessionTokenError> {
        if text.is_empty() {
            return Err(SessionTokenError::Empty);
        }

        let mut segments = text.split(SEGMENT_SEPARATOR);
        let first = segments.next().unwrap_or_default();
        let Some(second) = segments.next() else {
            // Legacy token: a single global LSN.
            let global_lsn = parse_number(text, first)?;
            return Ok(Self::new(0, global_lsn, []));
        };

        let version = parse_number(text, first)?;
        let global_lsn = parse_number(text, second)?;

        let mut region_progress = BTreeMap::new();
        for segment in segments {
            let (region, lsn) = segment.split_once(REGION_SEPARATOR).ok_or_else(|| {
                SessionTokenError::Malformed {
                    token: text.to_string(),
                    reason: format!("region segment '{}' is not '<region>=<lsn>'", segment),
                }
            })?;

            let region: RegionId = region.parse().map_err(|_| SessionTokenError::InvalidNumber {
                token: text.to_string(),
                segment: region.to_string(),
            })?;
            let lsn = parse_number(text, lsn)?;

            if region_progress.insert(region, lsn).is_some() {
                return Err(SessionTokenError::Malformed {
                    token: text.to_string(),
                    reason: format!("region {} appears more than once", region),
                });
            }
        }

        Ok(Self {
            version,
            global_lsn,
            region_progress,
        })
    }

    /// Global version of the partition's replica set.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Global logical sequence number.
    pub fn global_lsn(&self) -> u64 {
        self.global_lsn
    }

    /// Local LSN reached in a region, if the token tracks it.
    pub fn region_lsn(&self, region: RegionId) -> Option<u64> {
        self.region_progress.get(&region).copied()
    }

    /// Per-region progress, ordered by region id.
    pub fn region_progress(&self) -> impl Iterator<Item = (RegionId, u64)> + '_ {
        self.region_progress.iter().map(|(r, l)| (*r, *l))
    }

    /// Pairwise maximum of two tokens.
    ///
    /// Commutative and associative; regions present in only one operand are
    /// carried through unchanged.
    pub fn merge(&self, other: &SessionToken) -> SessionToken {
        let mut region_progress = self.region_progress.clone();
        for (region, lsn) in &other.region_progress {
            region_progress
                .entry(*region)
                .and_modify(|current| *current = (*current).max(*lsn))
                .or_insert(*lsn);
        }

        SessionToken {
            version: self.version.max(other.version),
            global_lsn: self.global_lsn.max(other.global_lsn),
            region_progress,
        }
    }

    /// Whether this token is at least as advanced as `other`.
    ///
    /// True iff this version is not lower and, for every region `other`
    /// tracks, this token tracks it with a local LSN that is not lower. Two
    /// tokens can each fail this check against the other.
    pub fn is_as_recent_as(&self, other: &SessionToken) -> bool {
        self.version >= other.version
            && other
                .region_progress
                .iter()
                .all(|(region, lsn)| self.region_progress.get(region).is_some_and(|own| own >= lsn))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.version, SEGMENT_SEPARATOR, self.global_lsn)?;
        for (region, lsn) in &self.region_progress {
            write!(f, "{}{}{}{}", SEGMENT_SEPARATOR, region, REGION_SEPARATOR, lsn)?;
        }
        Ok(())
    }
}

impl FromStr for SessionToken {
    type Err = SessionTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Arbitrary tokens over a small region space, so operands share regions.
#[cfg(test)]
pub(crate) fn token_strategy() -> impl proptest::strategy::Strategy<Value = SessionToken> {
    use proptest::prelude::*;

    (
        0u64..5,
        0u64..1_000,
        proptest::collection::btree_map(0u32..6, 0u64..1_000, 0..4),
    )
        .prop_map(|(version, global_lsn, regions)| SessionToken::new(version, global_lsn, regions))
}

fn parse_number(token: &str, segment: &str) -> Result<u64, SessionTokenError> {
    segment.parse().map_err(|_| SessionTokenError::InvalidNumber {
        token: token.to_string(),
        segment: segment.to_string(),
    })
}
