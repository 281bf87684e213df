use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(JobStatus::Submitted),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DispatchError::Internal(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

/// How many nodes must succeed, as the operator wrote it.
///
/// `"3"` is a node count, `"75%"` a share of the target list. Shares are
/// resolved to a count once, at job creation, rounding up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quorum {
    Count(u32),
    Percent(u32),
}

impl Quorum {
    /// Every target node must succeed.
    pub fn all() -> Self {
        Quorum::Percent(100)
    }

    pub fn resolve(&self, total_nodes: usize) -> Result<usize> {
        let required = match *self {
            Quorum::Count(n) => n as usize,
            Quorum::Percent(pct) => {
                if pct > 100 {
                    return Err(DispatchError::invalid(format!(
                        "quorum {pct}% is above 100%"
                    )));
                }
                (total_nodes * pct as usize).div_ceil(100)
            }
        };
        if required == 0 || required > total_nodes {
            return Err(DispatchError::invalid(format!(
                "quorum {self} resolves to {required}, outside 1..={total_nodes}"
            )));
        }
        Ok(required)
    }
}

impl std::fmt::Display for Quorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quorum::Count(n) => write!(f, "{n}"),
            Quorum::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

impl FromStr for Quorum {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse = |digits: &str| {
            digits
                .trim()
                .parse::<u32>()
                .map_err(|_| DispatchError::invalid(format!("malformed quorum {s:?}")))
        };
        match s.strip_suffix('%') {
            Some(pct) => Ok(Quorum::Percent(parse(pct)?)),
            None => Ok(Quorum::Count(parse(s)?)),
        }
    }
}

/// A command fanned out to a set of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub node_names: Vec<String>,
    pub quorum_spec: Quorum,
    /// `quorum_spec` resolved against `node_names` at creation.
    pub quorum: usize,
    pub timeout: Duration,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Validate a submission and build the job in `Submitted`.
    pub fn new(
        command: String,
        node_names: Vec<String>,
        quorum_spec: Quorum,
        timeout: Duration,
    ) -> Result<Self> {
        if command.trim().is_empty() {
            return Err(DispatchError::invalid("command cannot be empty"));
        }
        if node_names.is_empty() {
            return Err(DispatchError::invalid("node list cannot be empty"));
        }
        let mut seen = HashSet::new();
        for name in &node_names {
            if name.trim().is_empty() {
                return Err(DispatchError::invalid("node names cannot be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(DispatchError::invalid(format!(
                    "node {name} is listed more than once"
                )));
            }
        }
        if timeout.is_zero() {
            return Err(DispatchError::invalid("timeout must be positive"));
        }
        let quorum = quorum_spec.resolve(node_names.len())?;
        let now = Utc::now();

        Ok(Self {
            id: Uuid::new_v4(),
            command,
            node_names,
            quorum_spec,
            quorum,
            timeout,
            status: JobStatus::Submitted,
            created_at: now,
            updated_at: now,
        })
    }

    /// Instant after which every run still in flight is timed out.
    pub fn deadline(&self) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        self.created_at
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Move to `status`. Terminal jobs never change again.
    pub fn transition(&mut self, status: JobStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        self.updated_at = at.max(self.updated_at);
        true
    }
}
