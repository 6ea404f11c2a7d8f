//! Per-member hash observations

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// One member's answer to a HashKV request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HashSnapshot {
    /// Endpoint the answer came from
    pub endpoint: String,
    /// Member id from the response header
    pub member_id: u64,
    /// Revision the hash was computed at
    pub revision: i64,
    /// Content hash of the member's key space
    pub hash: u32,
    /// Latest compacted revision on that member
    pub compact_revision: i64,
}

impl HashSnapshot {
    pub fn new(endpoint: &str, member_id: u64, revision: i64, hash: u32) -> Self {
        HashSnapshot {
            endpoint: endpoint.to_string(),
            member_id,
            revision,
            hash,
            compact_revision: 0,
        }
    }

    pub fn with_compact_revision(mut self, compact_revision: i64) -> Self {
        self.compact_revision = compact_revision;
        self
    }
}

impl fmt::Display for HashSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (member {:016x}): revision={} hash={:08x}",
            self.endpoint, self.member_id, self.revision, self.hash
        )
    }
}

/// Convergence was not observed before the deadline
#[derive(Clone, Debug)]
pub struct ConvergenceTimeout {
    /// Time spent polling
    pub elapsed: Duration,
    /// Number of HashKV polls issued
    pub polls: u32,
    /// Members the check expected to hear from
    pub expected_members: usize,
    /// Snapshots from the last successful poll
    pub last: Vec<HashSnapshot>,
    /// Why the last poll did not pass
    pub last_reason: Option<String>,
}

impl fmt::Display for ConvergenceTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "members did not converge within {:?} ({} polls, expected {} members)",
            self.elapsed, self.polls, self.expected_members
        )?;
        if let Some(reason) = &self.last_reason {
            write!(f, "; last mismatch: {}", reason)?;
        }
        if self.last.is_empty() {
            write!(f, "; no snapshots observed")?;
        }
        for snapshot in &self.last {
            write!(f, "\n  {}", snapshot)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConvergenceTimeout {}
