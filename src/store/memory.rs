use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispatch::job::Job;
use crate::dispatch::output::OutputChannel;
use crate::dispatch::run::NodeRun;
use crate::error::Result;
use crate::store::{JobStore, OutputPiece};

#[derive(Debug)]
struct StoredRun {
    record: NodeRun,
    /// Transcript pieces keyed by channel and byte offset.
    pieces: BTreeMap<(u8, u64), OutputPiece>,
}

fn channel_key(channel: OutputChannel) -> u8 {
    match channel {
        OutputChannel::Stdout => 0,
        OutputChannel::Stderr => 1,
    }
}

impl StoredRun {
    fn load(&self) -> NodeRun {
        let mut run = self.record.clone();
        for piece in self.pieces.values() {
            piece.restore_into(&mut run);
        }
        run
    }
}

/// Keeps everything in process memory. Records survive only as long as the
/// store itself.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    runs: RwLock<HashMap<(Uuid, String), StoredRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_node_run(&self, run: &NodeRun, appended: &[OutputPiece]) -> Result<()> {
        let mut runs = self.runs.write().await;
        let stored = runs
            .entry((run.job_id, run.node_name.clone()))
            .or_insert_with(|| StoredRun {
                record: run.without_transcript(),
                pieces: BTreeMap::new(),
            });
        stored.record = run.without_transcript();
        for piece in appended {
            stored
                .pieces
                .entry((channel_key(piece.channel), piece.offset))
                .or_insert_with(|| piece.clone());
        }
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn load_node_runs(&self, job_id: Uuid) -> Result<Vec<NodeRun>> {
        let runs = self.runs.read().await;
        let mut found: Vec<NodeRun> = runs
            .values()
            .filter(|r| r.record.job_id == job_id)
            .map(StoredRun::load)
            .collect();
        found.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        Ok(found)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
