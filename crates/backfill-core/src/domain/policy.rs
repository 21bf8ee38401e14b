//! Revision selection policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::BackfillError;

/// The rule used to pick which revisions of a history to process.
///
/// Decoded once from its textual form (see [`FromStr`]); the selector only
/// ever matches on the variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum SelectionPolicy {
    /// Commits whose subject carries the version marker and the branch name.
    #[default]
    VersionTags,

    /// Commits whose CI status is exactly `success`.
    CiStatusSuccess,

    /// An explicit list of identifiers, used as given.
    ExplicitHashes(Vec<String>),

    /// One representative per burst of commits closer than the duration.
    TimeBatched(Duration),

    /// Every commit; equivalent to `TimeBatched` with a zero duration.
    All,
}

impl SelectionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionPolicy::VersionTags => "version_tags",
            SelectionPolicy::CiStatusSuccess => "status_success",
            SelectionPolicy::ExplicitHashes(_) => "hash",
            SelectionPolicy::TimeBatched(_) => "delay",
            SelectionPolicy::All => "all",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::ExplicitHashes(hashes) => write!(f, "hash={}", hashes.join(",")),
            SelectionPolicy::TimeBatched(d) => {
                let secs = d.as_secs();
                write!(
                    f,
                    "delay={:02}:{:02}:{:02}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60
                )
            }
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = BackfillError;

    /// Accepts `version_tags`, `status_success`, `hash=<id>[,<id>...]`,
    /// `delay=HH:MM:SS` and `all`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "version_tags" => return Ok(SelectionPolicy::VersionTags),
            "status_success" => return Ok(SelectionPolicy::CiStatusSuccess),
            "all" => return Ok(SelectionPolicy::All),
            _ => {}
        }

        if let Some(list) = s.strip_prefix("hash=") {
            let hashes: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
            if hashes.is_empty() {
                return Err(BackfillError::Configuration(
                    "hash= policy needs at least one commit id".to_string(),
                ));
            }
            return Ok(SelectionPolicy::ExplicitHashes(hashes));
        }

        if let Some(spec) = s.strip_prefix("delay=") {
            return parse_hms(spec).map(SelectionPolicy::TimeBatched);
        }

        Err(BackfillError::Configuration(format!(
            "unknown commit choice method \"{s}\""
        )))
    }
}

/// Parse an `HH:MM:SS` duration.
fn parse_hms(spec: &str) -> Result<Duration, BackfillError> {
    let malformed = || {
        BackfillError::Configuration(format!(
            "malformed delay \"{spec}\", expected HH:MM:SS"
        ))
    };

    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 3 {
        return Err(malformed());
    }
    let mut fields = [0u64; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        *field = part.trim().parse().map_err(|_| malformed())?;
    }
    let [h, m, sec] = fields;
    Ok(Duration::from_secs(h * 3600 + m * 60 + sec))
}
