//! Quorum decision for a job, as a pure function of its run outcomes.
//!
//! Nothing here touches shared state. The coordinator calls [`derive_status`]
//! after every run transition and again when a job is restored from storage,
//! so the same persisted runs always produce the same job status.

use crate::dispatch::job::JobStatus;
use crate::dispatch::run::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Satisfied,
    Unsatisfiable,
}

/// Decide whether `succeeded` runs already meet `quorum`, or whether the
/// runs not yet failed can no longer reach it.
pub fn evaluate(quorum: usize, total_nodes: usize, succeeded: usize, failed: usize) -> Verdict {
    if succeeded >= quorum {
        Verdict::Satisfied
    } else if total_nodes.saturating_sub(failed) < quorum {
        Verdict::Unsatisfiable
    } else {
        Verdict::Pending
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Runs that have left `Invited`.
    pub started: usize,
}

impl Tally {
    pub fn of<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = RunStatus>,
    {
        let mut tally = Tally::default();
        for status in statuses {
            tally.total += 1;
            if status == RunStatus::Succeeded {
                tally.succeeded += 1;
            } else if status.is_failure() {
                tally.failed += 1;
            }
            if status != RunStatus::Invited {
                tally.started += 1;
            }
        }
        tally
    }
}

/// Job status implied by the current run statuses.
///
/// `Cancelled` is an operator override and is never produced here; callers
/// keep it untouched.
pub fn derive_status<I>(quorum: usize, statuses: I) -> JobStatus
where
    I: IntoIterator<Item = RunStatus>,
{
    let tally = Tally::of(statuses);
    match evaluate(quorum, tally.total, tally.succeeded, tally.failed) {
        Verdict::Satisfied => JobStatus::Complete,
        Verdict::Unsatisfiable => JobStatus::Failed,
        Verdict::Pending if tally.started > 0 => JobStatus::Running,
        Verdict::Pending => JobStatus::Submitted,
    }
}
