use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::messaging::{InboundEvent, Messenger, NodeMessage};

const NODE_INBOX_CAPACITY: usize = 64;

/// A node's end of the bus: its inbox and a sender for its reports.
#[derive(Debug)]
pub struct NodeLink {
    pub node_name: String,
    pub inbox: mpsc::Receiver<NodeMessage>,
    pub events: mpsc::Sender<InboundEvent>,
}

/// In-process message bus keyed by node name.
#[derive(Debug)]
pub struct LocalBus {
    nodes: RwLock<HashMap<String, mpsc::Sender<NodeMessage>>>,
    inbound: mpsc::Sender<InboundEvent>,
}

impl LocalBus {
    /// Returns the bus and the receiving end of every node's reports.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<InboundEvent>) {
        let (inbound, inbound_rx) = mpsc::channel(capacity);
        let bus = Self {
            nodes: RwLock::new(HashMap::new()),
            inbound,
        };
        (Arc::new(bus), inbound_rx)
    }

    /// Attach a node. A node connecting again replaces its old inbox.
    pub async fn connect(&self, node_name: &str) -> NodeLink {
        let (tx, inbox) = mpsc::channel(NODE_INBOX_CAPACITY);
        self.nodes.write().await.insert(node_name.to_string(), tx);
        tracing::info!(node = %node_name, "Node connected");
        NodeLink {
            node_name: node_name.to_string(),
            inbox,
            events: self.inbound.clone(),
        }
    }

    pub async fn disconnect(&self, node_name: &str) {
        if self.nodes.write().await.remove(node_name).is_some() {
            tracing::info!(node = %node_name, "Node disconnected");
        }
    }

    pub async fn connected_nodes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn send(&self, node_name: &str, message: NodeMessage) -> Result<()> {
        let tx = self
            .nodes
            .read()
            .await
            .get(node_name)
            .cloned()
            .ok_or_else(|| DispatchError::DispatchFailure {
                node_name: node_name.to_string(),
                reason: "node not connected".to_string(),
            })?;
        tx.send(message)
            .await
            .map_err(|_| DispatchError::DispatchFailure {
                node_name: node_name.to_string(),
                reason: "node inbox closed".to_string(),
            })
    }
}

#[async_trait]
impl Messenger for LocalBus {
    async fn publish(&self, node_name: &str, job_id: Uuid, command: &str) -> Result<()> {
        self.send(
            node_name,
            NodeMessage::Run {
                job_id,
                command: command.to_string(),
            },
        )
        .await
    }

    async fn cancel(&self, node_name: &str, job_id: Uuid) -> Result<()> {
        self.send(node_name, NodeMessage::Cancel { job_id }).await
    }
}
