//! Contract with the messaging layer that carries commands to nodes and
//! brings their acknowledgments, output and results back.
//!
//! Payloads are typed at this boundary: outbound traffic is a
//! [`NodeMessage`], inbound traffic an [`InboundEvent`]. Delivery is
//! at-least-once and may reorder events of one node.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dispatch::output::OutputChunk;
use crate::error::Result;

pub use local::{LocalBus, NodeLink};

/// Sent from the dispatcher to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    Run { job_id: Uuid, command: String },
    Cancel { job_id: Uuid },
}

/// Reported by a node about one of its runs.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Ack {
        job_id: Uuid,
        node_name: String,
        at: DateTime<Utc>,
    },
    Started {
        job_id: Uuid,
        node_name: String,
        at: DateTime<Utc>,
    },
    Output(OutputChunk),
    Completion {
        job_id: Uuid,
        node_name: String,
        exit_status: i32,
        at: DateTime<Utc>,
    },
    Error {
        job_id: Uuid,
        node_name: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl InboundEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            InboundEvent::Ack { job_id, .. }
            | InboundEvent::Started { job_id, .. }
            | InboundEvent::Completion { job_id, .. }
            | InboundEvent::Error { job_id, .. } => *job_id,
            InboundEvent::Output(chunk) => chunk.job_id,
        }
    }

    pub fn node_name(&self) -> &str {
        match self {
            InboundEvent::Ack { node_name, .. }
            | InboundEvent::Started { node_name, .. }
            | InboundEvent::Completion { node_name, .. }
            | InboundEvent::Error { node_name, .. } => node_name,
            InboundEvent::Output(chunk) => &chunk.node_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Ack { .. } => "ack",
            InboundEvent::Started { .. } => "started",
            InboundEvent::Output(_) => "output",
            InboundEvent::Completion { .. } => "completion",
            InboundEvent::Error { .. } => "error",
        }
    }
}

#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Hand `command` to `node_name`. Fails with `DispatchFailure` when the
    /// node cannot be reached.
    async fn publish(&self, node_name: &str, job_id: Uuid, command: &str) -> Result<()>;

    /// Ask `node_name` to stop working on `job_id`. Best effort.
    async fn cancel(&self, node_name: &str, job_id: Uuid) -> Result<()>;
}
