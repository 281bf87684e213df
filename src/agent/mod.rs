//! In-process node agent.
//!
//! Stands in for a managed node: it takes commands off its [`NodeLink`],
//! acknowledges them, runs them through a [`CommandExecutor`] and streams
//! output and the exit status back to the dispatcher.
//!
//! A repeated `Run` for a job the agent is executing, or has recently
//! finished, is acknowledged again but not re-executed, since the bus may
//! deliver a message twice. The agent remembers the last
//! [`FINISHED_JOBS_KEPT`] finished jobs.

pub mod executor;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::messaging::{InboundEvent, NodeLink, NodeMessage};

pub use executor::{CommandExecutor, ExecutionResult};

pub const FINISHED_JOBS_KEPT: usize = 1024;

/// Jobs this agent has taken on: those executing and a bounded memory of
/// those that ended.
#[derive(Default)]
struct JobTable {
    running: HashMap<Uuid, CancellationToken>,
    finished: HashSet<Uuid>,
    finished_order: VecDeque<Uuid>,
}

impl JobTable {
    fn knows(&self, job_id: &Uuid) -> bool {
        self.running.contains_key(job_id) || self.finished.contains(job_id)
    }

    fn finish(&mut self, job_id: Uuid) {
        self.running.remove(&job_id);
        if self.finished.insert(job_id) {
            self.finished_order.push_back(job_id);
        }
        while self.finished_order.len() > FINISHED_JOBS_KEPT {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

pub struct NodeAgent {
    link: NodeLink,
    executor: CommandExecutor,
    jobs: Arc<Mutex<JobTable>>,
}

impl NodeAgent {
    pub fn new(link: NodeLink, chunk_size: usize) -> Self {
        let executor = CommandExecutor::new(link.node_name.clone(), chunk_size);
        Self {
            link,
            executor,
            jobs: Arc::new(Mutex::new(JobTable::default())),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.link.node_name
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(node = %self.link.node_name, "Node agent started");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.link.inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                NodeMessage::Run { job_id, command } => self.start(job_id, command, &shutdown).await,
                NodeMessage::Cancel { job_id } => {
                    if let Some(token) = self.jobs.lock().await.running.get(&job_id) {
                        tracing::info!(job_id = %job_id, node = %self.link.node_name, "Cancelling command");
                        token.cancel();
                    }
                }
            }
        }

        for token in self.jobs.lock().await.running.values() {
            token.cancel();
        }
        tracing::info!(node = %self.link.node_name, "Node agent stopped");
    }

    async fn start(&self, job_id: Uuid, command: String, shutdown: &CancellationToken) {
        let node_name = self.link.node_name.clone();
        let events = self.link.events.clone();
        let ack = InboundEvent::Ack {
            job_id,
            node_name: node_name.clone(),
            at: Utc::now(),
        };
        if events.send(ack).await.is_err() {
            return;
        }

        let cancel = {
            let mut jobs = self.jobs.lock().await;
            if jobs.knows(&job_id) {
                tracing::debug!(job_id = %job_id, node = %node_name, "Command already taken, not run again");
                return;
            }
            let token = shutdown.child_token();
            jobs.running.insert(job_id, token.clone());
            token
        };

        let started = InboundEvent::Started {
            job_id,
            node_name: node_name.clone(),
            at: Utc::now(),
        };
        let _ = events.send(started).await;

        let executor = self.executor.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let result = executor.execute(job_id, &command, events, cancel).await;
            tracing::debug!(job_id = %job_id, node = %node_name, result = ?result, "Execution finished");
            jobs.lock().await.finish(job_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{LocalBus, Messenger};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next(rx: &mut mpsc::Receiver<InboundEvent>) -> InboundEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within 5s")
            .expect("bus open")
    }

    #[tokio::test]
    async fn acks_then_reports_completion() {
        let (bus, mut inbound) = LocalBus::new(64);
        let agent = NodeAgent::new(bus.connect("web1").await, 1024);
        let shutdown = CancellationToken::new();
        tokio::spawn(agent.run(shutdown.clone()));

        let job_id = Uuid::new_v4();
        bus.publish("web1", job_id, "echo hi").await.unwrap();

        assert_eq!(next(&mut inbound).await.kind(), "ack");
        assert_eq!(next(&mut inbound).await.kind(), "started");

        let mut stdout = Vec::new();
        loop {
            match next(&mut inbound).await {
                InboundEvent::Output(chunk) if chunk.channel == crate::dispatch::OutputChannel::Stdout => {
                    stdout.extend(chunk.payload)
                }
                InboundEvent::Output(_) => {}
                InboundEvent::Completion { exit_status, .. } => {
                    assert_eq!(exit_status, 0);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(stdout, b"hi\n");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn redelivered_run_after_completion_is_not_executed_again() {
        let (bus, mut inbound) = LocalBus::new(64);
        let agent = NodeAgent::new(bus.connect("web1").await, 1024);
        let shutdown = CancellationToken::new();
        tokio::spawn(agent.run(shutdown.clone()));

        let job_id = Uuid::new_v4();
        bus.publish("web1", job_id, "echo hi").await.unwrap();
        loop {
            if let InboundEvent::Completion { .. } = next(&mut inbound).await {
                break;
            }
        }
        // Let the agent record the job as finished.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish("web1", job_id, "echo hi").await.unwrap();
        assert_eq!(next(&mut inbound).await.kind(), "ack");
        let extra = tokio::time::timeout(Duration::from_millis(300), inbound.recv()).await;
        assert!(extra.is_err(), "unexpected event {extra:?}");
        shutdown.cancel();
    }

    #[test]
    fn finished_jobs_are_forgotten_oldest_first() {
        let mut table = JobTable::default();
        let first = Uuid::new_v4();
        table.running.insert(first, CancellationToken::new());
        table.finish(first);
        assert!(table.knows(&first));
        assert!(table.running.is_empty());

        for _ in 0..FINISHED_JOBS_KEPT {
            table.finish(Uuid::new_v4());
        }
        assert!(!table.knows(&first));
        assert_eq!(table.finished.len(), FINISHED_JOBS_KEPT);
        assert_eq!(table.finished_order.len(), FINISHED_JOBS_KEPT);
    }

    #[tokio::test]
    async fn cancel_kills_running_command() {
        let (bus, mut inbound) = LocalBus::new(64);
        let agent = NodeAgent::new(bus.connect("web1").await, 1024);
        let shutdown = CancellationToken::new();
        tokio::spawn(agent.run(shutdown.clone()));

        let job_id = Uuid::new_v4();
        bus.publish("web1", job_id, "sleep 30").await.unwrap();
        assert_eq!(next(&mut inbound).await.kind(), "ack");
        assert_eq!(next(&mut inbound).await.kind(), "started");

        bus.cancel("web1", job_id).await.unwrap();

        // No completion is reported for a killed command.
        let after = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match inbound.recv().await {
                    Some(InboundEvent::Completion { .. }) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await;
        assert!(!matches!(after, Ok(true)));
        shutdown.cancel();
    }
}
