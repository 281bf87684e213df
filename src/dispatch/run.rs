use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::output::{ChannelCursor, OutputChannel, OutputGap};
use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Invited,
    Acked,
    Running,
    Succeeded,
    Failed,
    NackTimedOut,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::NackTimedOut | RunStatus::Cancelled
        )
    }

    /// Terminal outcomes that can no longer contribute to a quorum.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::NackTimedOut | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Invited => write!(f, "invited"),
            RunStatus::Acked => write!(f, "acked"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::NackTimedOut => write!(f, "nack_timed_out"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invited" => Ok(RunStatus::Invited),
            "acked" => Ok(RunStatus::Acked),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "nack_timed_out" => Ok(RunStatus::NackTimedOut),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(DispatchError::Internal(format!(
                "unknown run status {other:?}"
            ))),
        }
    }
}

/// Something that happened to one node's run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Ack { at: DateTime<Utc> },
    Started { at: DateTime<Utc> },
    Completed { exit_status: i32, at: DateTime<Utc> },
    Errored { reason: String, at: DateTime<Utc> },
    DispatchFailed { reason: String, at: DateTime<Utc> },
    TimedOut { at: DateTime<Utc> },
    Cancelled { reason: String, at: DateTime<Utc> },
}

impl RunEvent {
    /// Events that end a run if it is still in flight.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Ack { .. } | RunEvent::Started { .. })
    }
}

/// Result of applying a [`RunEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: RunStatus, to: RunStatus },
    /// Duplicate of something already applied.
    Unchanged,
    /// The run was already terminal.
    Stale,
}

/// One node's execution record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRun {
    pub job_id: Uuid,
    pub node_name: String,
    pub status: RunStatus,
    pub ack_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: Option<i32>,
    pub output: Vec<u8>,
    pub error_output: Vec<u8>,
    /// Why the run failed, timed out or was cancelled.
    pub error: Option<String>,
    pub stdout_cursor: ChannelCursor,
    pub stderr_cursor: ChannelCursor,
    pub gaps: Vec<OutputGap>,
}

impl NodeRun {
    pub fn new(job_id: Uuid, node_name: String) -> Self {
        Self {
            job_id,
            node_name,
            status: RunStatus::Invited,
            ack_time: None,
            end_time: None,
            exit_status: None,
            output: Vec::new(),
            error_output: Vec::new(),
            error: None,
            stdout_cursor: ChannelCursor::default(),
            stderr_cursor: ChannelCursor::default(),
            gaps: Vec::new(),
        }
    }

    pub fn transcript(&self, channel: OutputChannel) -> &[u8] {
        match channel {
            OutputChannel::Stdout => &self.output,
            OutputChannel::Stderr => &self.error_output,
        }
    }

    pub fn cursor(&self, channel: OutputChannel) -> ChannelCursor {
        match channel {
            OutputChannel::Stdout => self.stdout_cursor,
            OutputChannel::Stderr => self.stderr_cursor,
        }
    }

    /// Append assembled bytes. Returns false once the run is terminal.
    /// A copy with both transcripts left empty.
    pub fn without_transcript(&self) -> NodeRun {
        NodeRun {
            job_id: self.job_id,
            node_name: self.node_name.clone(),
            status: self.status,
            ack_time: self.ack_time,
            end_time: self.end_time,
            exit_status: self.exit_status,
            output: Vec::new(),
            error_output: Vec::new(),
            error: self.error.clone(),
            stdout_cursor: self.stdout_cursor,
            stderr_cursor: self.stderr_cursor,
            gaps: self.gaps.clone(),
        }
    }

    pub fn append_output(&mut self, channel: OutputChannel, bytes: &[u8]) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match channel {
            OutputChannel::Stdout => self.output.extend_from_slice(bytes),
            OutputChannel::Stderr => self.error_output.extend_from_slice(bytes),
        }
        true
    }

    pub fn set_cursor(&mut self, channel: OutputChannel, cursor: ChannelCursor) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match channel {
            OutputChannel::Stdout => self.stdout_cursor = cursor,
            OutputChannel::Stderr => self.stderr_cursor = cursor,
        }
        true
    }

    pub fn record_gap(&mut self, gap: OutputGap) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.gaps.push(gap);
        true
    }

    pub fn apply(&mut self, event: &RunEvent) -> Transition {
        let from = self.status;
        if from.is_terminal() {
            return Transition::Stale;
        }

        match event {
            RunEvent::Ack { at } => {
                if from != RunStatus::Invited {
                    return Transition::Unchanged;
                }
                self.ack_time = Some(*at);
                self.status = RunStatus::Acked;
            }
            RunEvent::Started { at } => {
                if from == RunStatus::Running {
                    return Transition::Unchanged;
                }
                self.ack_time.get_or_insert(*at);
                self.status = RunStatus::Running;
            }
            RunEvent::Completed { exit_status, at } => {
                self.ack_time.get_or_insert(*at);
                self.exit_status = Some(*exit_status);
                self.finish(
                    if *exit_status == 0 {
                        RunStatus::Succeeded
                    } else {
                        RunStatus::Failed
                    },
                    *at,
                );
            }
            RunEvent::Errored { reason, at } => {
                self.ack_time.get_or_insert(*at);
                self.error = Some(reason.clone());
                self.finish(RunStatus::Failed, *at);
            }
            RunEvent::DispatchFailed { reason, at } => {
                self.error = Some(format!("dispatch failed: {reason}"));
                self.finish(RunStatus::Failed, *at);
            }
            RunEvent::TimedOut { at } => {
                self.error = Some(if from == RunStatus::Invited {
                    "no acknowledgment before the job deadline".to_string()
                } else {
                    "no completion before the job deadline".to_string()
                });
                self.finish(RunStatus::NackTimedOut, *at);
            }
            RunEvent::Cancelled { reason, at } => {
                self.error = Some(reason.clone());
                self.finish(RunStatus::Cancelled, *at);
            }
        }

        Transition::Moved {
            from,
            to: self.status,
        }
    }

    fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        let end = match self.ack_time {
            Some(ack) => at.max(ack),
            None => at,
        };
        self.end_time = Some(end);
        self.status = status;
    }
}
