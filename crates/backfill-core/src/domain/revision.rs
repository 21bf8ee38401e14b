//! Revisions and commit log entries.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Length of the abbreviated commit id shown on the dashboard.
pub const SHORT_ID_LEN: usize = 7;

/// One entry of a version-control log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    /// Full commit identifier.
    pub id: String,

    /// Committer timestamp.
    pub timestamp: DateTime<FixedOffset>,

    /// First line of the commit message.
    pub subject: String,
}

impl CommitEntry {
    pub fn new(id: &str, timestamp: DateTime<FixedOffset>, subject: &str) -> Self {
        Self {
            id: id.to_string(),
            timestamp,
            subject: subject.to_string(),
        }
    }
}

/// A revision selected for processing.
///
/// Identity is the identifier string alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: String,

    /// Commit timestamp, unknown for explicitly listed hashes.
    pub timestamp: Option<DateTime<FixedOffset>>,

    pub branch: String,
}

impl Revision {
    pub fn new(id: &str, branch: &str) -> Self {
        Self {
            id: id.to_string(),
            timestamp: None,
            branch: branch.to_string(),
        }
    }

    pub fn from_entry(entry: &CommitEntry, branch: &str) -> Self {
        Self {
            id: entry.id.clone(),
            timestamp: Some(entry.timestamp),
            branch: branch.to_string(),
        }
    }

    /// Abbreviated identifier.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(SHORT_ID_LEN)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Revision {}

impl std::hash::Hash for Revision {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let rev = Revision::new("0123456789abcdef", "trunk");
        assert_eq!(rev.short_id(), "0123456");

        let short = Revision::new("abc", "trunk");
        assert_eq!(short.short_id(), "abc");
    }

    #[test]
    fn test_identity_is_id_only() {
        let ts = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap();
        let a = Revision::from_entry(&CommitEntry::new("abc", ts, "msg"), "trunk");
        let b = Revision::new("abc", "4.07");
        assert_eq!(a, b);
    }
}
