//! Test harness for dispatcher tests.
//!
//! Provides a scripted messenger, a store that can be made to fail, and a
//! running coordinator that tests feed node events into.
#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleet_dispatch::config::{CoordinatorConfig, RetryConfig};
use fleet_dispatch::dispatch::{
    DispatchCoordinator, Job, JobStatus, NodeRun, OutputChannel, OutputChunk, Quorum, RunStatus,
};
use fleet_dispatch::error::{DispatchError, Result};
use fleet_dispatch::messaging::{InboundEvent, Messenger};
use fleet_dispatch::store::{JobStore, MemoryStore, OutputPiece};

/// Messenger that records traffic instead of delivering it.
#[derive(Default)]
pub struct RecordingMessenger {
    pub published: Mutex<Vec<(String, Uuid, String)>>,
    pub cancelled: Mutex<Vec<(String, Uuid)>>,
    unreachable: HashSet<String>,
}

impl RecordingMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishing to any of `nodes` fails with `DispatchFailure`.
    pub fn with_unreachable(nodes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            unreachable: nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        })
    }

    pub async fn published_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .published
            .lock()
            .await
            .iter()
            .map(|(n, _, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub async fn cancelled_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .cancelled
            .lock()
            .await
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn publish(&self, node_name: &str, job_id: Uuid, command: &str) -> Result<()> {
        if self.unreachable.contains(node_name) {
            return Err(DispatchError::DispatchFailure {
                node_name: node_name.to_string(),
                reason: "node not connected".to_string(),
            });
        }
        self.published
            .lock()
            .await
            .push((node_name.to_string(), job_id, command.to_string()));
        Ok(())
    }

    async fn cancel(&self, node_name: &str, job_id: Uuid) -> Result<()> {
        self.cancelled
            .lock()
            .await
            .push((node_name.to_string(), job_id));
        Ok(())
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    pub write_attempts: AtomicU32,
    /// Transcript bytes handed to successful run saves.
    pub output_bytes_written: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` writes fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, on: bool) {
        self.always_fail.store(on, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(DispatchError::storage("write", "disk unavailable"));
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(DispatchError::storage("write", "database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.check_write()?;
        self.inner.save_job(job).await
    }

    async fn save_node_run(&self, run: &NodeRun, appended: &[OutputPiece]) -> Result<()> {
        self.check_write()?;
        let bytes: usize = appended.iter().map(|p| p.bytes.len()).sum();
        self.output_bytes_written
            .fetch_add(bytes as u64, Ordering::SeqCst);
        self.inner.save_node_run(run, appended).await
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.inner.load_job(id).await
    }

    async fn load_node_runs(&self, job_id: Uuid) -> Result<Vec<NodeRun>> {
        self.inner.load_node_runs(job_id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.inner.list_jobs().await
    }
}

/// Coordinator settings with millisecond retries.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        event_workers: 4,
        ..CoordinatorConfig::default()
    }
}

/// A coordinator with its event loop running.
pub struct TestDispatcher {
    pub coordinator: Arc<DispatchCoordinator>,
    pub messenger: Arc<RecordingMessenger>,
    pub events: mpsc::Sender<InboundEvent>,
    pub shutdown: CancellationToken,
}

impl TestDispatcher {
    pub async fn start() -> Self {
        Self::start_with(fast_config(), Arc::new(MemoryStore::new()), RecordingMessenger::new())
            .await
    }

    pub async fn start_with(
        config: CoordinatorConfig,
        store: Arc<dyn JobStore>,
        messenger: Arc<RecordingMessenger>,
    ) -> Self {
        let (coordinator, driver) = DispatchCoordinator::new(config, store, messenger.clone());
        let (events, inbound) = mpsc::channel(1024);
        let shutdown = CancellationToken::new();
        tokio::spawn(
            coordinator
                .clone()
                .run(driver, inbound, shutdown.clone()),
        );
        Self {
            coordinator,
            messenger,
            events,
            shutdown,
        }
    }

    pub async fn submit(&self, nodes: &[&str], quorum: &str, timeout: Duration) -> Uuid {
        let quorum: Quorum = quorum.parse().expect("valid quorum");
        self.coordinator
            .submit(
                "uptime".to_string(),
                nodes.iter().map(|n| n.to_string()).collect(),
                quorum,
                Some(timeout),
            )
            .await
            .expect("submission accepted")
    }

    pub async fn send(&self, event: InboundEvent) {
        self.events.send(event).await.expect("coordinator running");
    }

    pub async fn job_status(&self, job_id: Uuid) -> JobStatus {
        self.coordinator.status(job_id).await.unwrap().job.status
    }

    pub async fn run_status(&self, job_id: Uuid, node: &str) -> RunStatus {
        self.coordinator
            .status(job_id)
            .await
            .unwrap()
            .run(node)
            .unwrap()
            .status
    }

    pub async fn wait_for_job(&self, job_id: Uuid, status: JobStatus) {
        assert_eventually(
            || async { self.job_status(job_id).await == status },
            Duration::from_secs(5),
            &format!("job should reach {status}"),
        )
        .await;
    }

    pub async fn wait_for_run(&self, job_id: Uuid, node: &str, status: RunStatus) {
        assert_eventually(
            || async { self.run_status(job_id, node).await == status },
            Duration::from_secs(5),
            &format!("run on {node} should reach {status}"),
        )
        .await;
    }
}

impl Drop for TestDispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn ack(job_id: Uuid, node: &str) -> InboundEvent {
    InboundEvent::Ack {
        job_id,
        node_name: node.to_string(),
        at: Utc::now(),
    }
}

pub fn completion(job_id: Uuid, node: &str, exit_status: i32) -> InboundEvent {
    InboundEvent::Completion {
        job_id,
        node_name: node.to_string(),
        exit_status,
        at: Utc::now(),
    }
}

pub fn chunk(job_id: Uuid, node: &str, sequence: u64, payload: &str, is_final: bool) -> OutputChunk {
    OutputChunk {
        job_id,
        node_name: node.to_string(),
        sequence,
        channel: OutputChannel::Stdout,
        payload: payload.as_bytes().to_vec(),
        is_final,
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
