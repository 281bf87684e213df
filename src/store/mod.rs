//! Durable storage for jobs and node runs.
//!
//! The coordinator only sees [`JobStore`]; which backend sits behind it is
//! decided once at startup. Every write covers one record and is atomic for
//! that record.
//!
//! Transcripts are stored as the pieces appended to them, so saving a run
//! writes only the bytes that arrived since its last save.

pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use crate::config::{RetryConfig, StoreBackend};
use crate::dispatch::job::Job;
use crate::dispatch::output::OutputChannel;
use crate::dispatch::run::NodeRun;
use crate::error::{DispatchError, Result};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Bytes appended to one channel of a run's transcript at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPiece {
    pub channel: OutputChannel,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl OutputPiece {
    /// The whole transcript of `run` as pieces starting at offset zero.
    pub fn whole(run: &NodeRun) -> Vec<OutputPiece> {
        [OutputChannel::Stdout, OutputChannel::Stderr]
            .into_iter()
            .filter(|c| !run.transcript(*c).is_empty())
            .map(|channel| OutputPiece {
                channel,
                offset: 0,
                bytes: run.transcript(channel).to_vec(),
            })
            .collect()
    }

    /// Fold the piece back into `run`, skipping bytes it already holds.
    pub fn restore_into(&self, run: &mut NodeRun) {
        let transcript = match self.channel {
            OutputChannel::Stdout => &mut run.output,
            OutputChannel::Stderr => &mut run.error_output,
        };
        let held = transcript.len() as u64;
        let end = self.offset + self.bytes.len() as u64;
        if end > held {
            let skip = held.saturating_sub(self.offset) as usize;
            transcript.extend_from_slice(&self.bytes[skip..]);
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Upsert everything about `run` except its transcript, and add
    /// `appended` to the stored transcript in the same write.
    ///
    /// A piece whose offset is already stored is ignored, so saving the
    /// same pieces twice is harmless. `run.output` and `run.error_output`
    /// are never written.
    async fn save_node_run(&self, run: &NodeRun, appended: &[OutputPiece]) -> Result<()>;

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn load_node_runs(&self, job_id: Uuid) -> Result<Vec<NodeRun>>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>>;
}

pub fn open(backend: &StoreBackend) -> Result<Arc<dyn JobStore>> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}

/// Run `op` until it succeeds, retrying storage failures with backoff.
/// Other errors are returned as they are.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(DispatchError::StorageFailure(reason)) if attempt + 1 < policy.max_attempts => {
                let base = policy.backoff(attempt);
                let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                let delay = base + std::time::Duration::from_millis(jitter_ms);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Storage write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
