use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::dispatch::job::{Job, JobStatus, Quorum};
use crate::dispatch::output::{OutputAssembler, OutputChannel, OutputChunk, OutputGap, Segment};
use crate::dispatch::quorum;
use crate::dispatch::run::{NodeRun, RunEvent, RunStatus, Transition};
use crate::dispatch::timeout::{TimeoutHandle, TimeoutSupervisor};
use crate::error::{DispatchError, Result};
use crate::messaging::{InboundEvent, Messenger};
use crate::store::{with_retry, JobStore, OutputPiece};

/// What happened to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Moved { from: RunStatus, to: RunStatus },
    /// Output was folded into the transcript (possibly zero bytes if the
    /// chunk was buffered out of order).
    Output { appended: usize, data_loss: bool },
    /// Replay of something already applied.
    Unchanged,
    /// The run had already finished.
    Stale,
}

/// A change to a run's live transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Append {
        channel: OutputChannel,
        bytes: Vec<u8>,
        loss_marker: bool,
    },
    /// The run is terminal; nothing more will be appended.
    End,
}

/// Transcript so far plus a feed of everything appended afterwards.
#[derive(Debug)]
pub struct OutputWatch {
    pub output: Vec<u8>,
    pub error_output: Vec<u8>,
    pub finished: bool,
    pub updates: broadcast::Receiver<TranscriptEvent>,
}

/// Read-only snapshot of a job and its runs, ordered like the job's node
/// list.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub job: Job,
    pub runs: Vec<NodeRun>,
    pub persistence_degraded: bool,
}

impl JobView {
    pub fn run(&self, node_name: &str) -> Option<&NodeRun> {
        self.runs.iter().find(|r| r.node_name == node_name)
    }
}

/// One channel of one run whose buffered output has a reorder deadline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReorderKey {
    job_id: Uuid,
    node_name: String,
    channel: OutputChannel,
}

struct RunSlot {
    run: NodeRun,
    assembler: OutputAssembler,
    watchers: broadcast::Sender<TranscriptEvent>,
    /// Transcript bytes the store has not accepted yet.
    unsaved: Vec<OutputPiece>,
    /// Reorder deadlines handed to the supervisor, per channel.
    armed: HashMap<OutputChannel, Instant>,
}

impl RunSlot {
    fn new(run: NodeRun, assembler: OutputAssembler, watchers: broadcast::Sender<TranscriptEvent>) -> Self {
        Self {
            run,
            assembler,
            watchers,
            unsaved: Vec::new(),
            armed: HashMap::new(),
        }
    }

    fn reorder_key(&self, channel: OutputChannel) -> ReorderKey {
        ReorderKey {
            job_id: self.run.job_id,
            node_name: self.run.node_name.clone(),
            channel,
        }
    }

    /// Arm, move or clear the reorder deadline of `channel` to match what the
    /// assembler is holding back.
    fn sync_reorder_deadline(&mut self, channel: OutputChannel, reorder: &TimeoutHandle<ReorderKey>) {
        match self.assembler.reorder_deadline(channel) {
            Some(at) if self.armed.get(&channel) != Some(&at) => {
                reorder.schedule_in(
                    self.reorder_key(channel),
                    at.saturating_duration_since(Instant::now()),
                );
                self.armed.insert(channel, at);
            }
            Some(_) => {}
            None => {
                if self.armed.remove(&channel).is_some() {
                    reorder.clear(self.reorder_key(channel));
                }
            }
        }
    }

    fn note_unsaved(&mut self, channel: OutputChannel, offset: u64, bytes: &[u8]) {
        if let Some(last) = self.unsaved.last_mut() {
            if last.channel == channel && last.offset + last.bytes.len() as u64 == offset {
                last.bytes.extend_from_slice(bytes);
                return;
            }
        }
        self.unsaved.push(OutputPiece {
            channel,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Append assembled segments, recording a gap for every loss marker.
    fn append(&mut self, channel: OutputChannel, segments: Vec<Segment>) -> (usize, bool) {
        let mut appended = 0;
        let mut data_loss = false;
        for segment in segments {
            let offset = self.run.transcript(channel).len() as u64;
            let bytes = segment.bytes();
            let loss_marker = match segment {
                Segment::Loss {
                    missing_from,
                    missing_to,
                    reason,
                } => {
                    tracing::warn!(
                        job_id = %self.run.job_id,
                        node = %self.run.node_name,
                        channel = %channel,
                        missing_from,
                        missing_to,
                        reason = %reason,
                        "Output chunks lost, transcript flushed across gap"
                    );
                    self.run.record_gap(OutputGap {
                        channel,
                        missing_from,
                        missing_to,
                        offset,
                        reason,
                    });
                    data_loss = true;
                    true
                }
                Segment::Data(_) => false,
            };
            if self.run.append_output(channel, &bytes) {
                if !bytes.is_empty() {
                    self.note_unsaved(channel, offset, &bytes);
                }
                appended += bytes.len();
                let _ = self.watchers.send(TranscriptEvent::Append {
                    channel,
                    bytes,
                    loss_marker,
                });
            }
        }
        self.run
            .set_cursor(channel, self.assembler.cursor(channel));
        (appended, data_loss)
    }
}

struct JobState {
    job: Job,
    /// Latest status seen per run, for the quorum re-check.
    statuses: HashMap<String, RunStatus>,
}

struct JobEntry {
    id: Uuid,
    state: Mutex<JobState>,
    runs: HashMap<String, Arc<Mutex<RunSlot>>>,
    degraded: AtomicBool,
}

impl JobEntry {
    fn new(job: Job, runs: Vec<NodeRun>, config: &CoordinatorConfig) -> Self {
        let statuses = runs
            .iter()
            .map(|r| (r.node_name.clone(), r.status))
            .collect();
        let slots = runs
            .into_iter()
            .map(|run| {
                let (watchers, _) = broadcast::channel(config.transcript_buffer.max(1));
                let assembler =
                    OutputAssembler::resume(config.output, run.stdout_cursor, run.stderr_cursor);
                (
                    run.node_name.clone(),
                    Arc::new(Mutex::new(RunSlot::new(run, assembler, watchers))),
                )
            })
            .collect();
        Self {
            id: job.id,
            state: Mutex::new(JobState { job, statuses }),
            runs: slots,
            degraded: AtomicBool::new(false),
        }
    }

    fn slot(&self, node_name: &str) -> Result<Arc<Mutex<RunSlot>>> {
        self.runs
            .get(node_name)
            .cloned()
            .ok_or_else(|| DispatchError::RunNotFound {
                job_id: self.id,
                node_name: node_name.to_string(),
            })
    }
}

fn rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Invited => 0,
        RunStatus::Acked => 1,
        RunStatus::Running => 2,
        _ => 3,
    }
}

/// The pieces [`DispatchCoordinator::run`] drives in the background.
pub struct CoordinatorDriver {
    supervisor: TimeoutSupervisor,
    expired: mpsc::Receiver<Uuid>,
    reorder_supervisor: TimeoutSupervisor<ReorderKey>,
    reorder_expired: mpsc::Receiver<ReorderKey>,
}

/// Owns every job and node run and applies all changes to them.
///
/// Each node run has its own lock and every event for that run is applied
/// under it, persisted, and only then folded into the job's quorum check,
/// which takes the job lock. The job lock is never held while a run lock is
/// being acquired.
pub struct DispatchCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn JobStore>,
    messenger: Arc<dyn Messenger>,
    timeouts: TimeoutHandle,
    reorder: TimeoutHandle<ReorderKey>,
    jobs: RwLock<HashMap<Uuid, Arc<JobEntry>>>,
}

impl DispatchCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn JobStore>,
        messenger: Arc<dyn Messenger>,
    ) -> (Arc<Self>, CoordinatorDriver) {
        let (expired_tx, expired) = mpsc::channel(256);
        let (supervisor, timeouts) = TimeoutSupervisor::new("job deadline", expired_tx);
        let (reorder_tx, reorder_expired) = mpsc::channel(256);
        let (reorder_supervisor, reorder) = TimeoutSupervisor::new("reorder window", reorder_tx);
        let coordinator = Self {
            config,
            store,
            messenger,
            timeouts,
            reorder,
            jobs: RwLock::new(HashMap::new()),
        };
        (
            Arc::new(coordinator),
            CoordinatorDriver {
                supervisor,
                expired,
                reorder_supervisor,
                reorder_expired,
            },
        )
    }

    /// Consume inbound node events, job deadlines and reorder deadlines until
    /// shutdown.
    ///
    /// Events are spread over `event_workers` shards by `(job, node)`, so the
    /// events of one run are applied in the order they arrived while distinct
    /// runs proceed in parallel.
    pub async fn run(
        self: Arc<Self>,
        driver: CoordinatorDriver,
        mut inbound: mpsc::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) {
        let CoordinatorDriver {
            supervisor,
            mut expired,
            reorder_supervisor,
            mut reorder_expired,
        } = driver;
        tokio::spawn(supervisor.run(shutdown.clone()));
        tokio::spawn(reorder_supervisor.run(shutdown.clone()));

        let mut shards = Vec::new();
        for _ in 0..self.config.event_workers.max(1) {
            let (tx, mut rx) = mpsc::channel::<InboundEvent>(256);
            let coordinator = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let job_id = event.job_id();
                    let kind = event.kind();
                    if let Err(e) = coordinator.handle_event(event).await {
                        tracing::warn!(job_id = %job_id, kind, error = %e, "Dropped inbound event");
                    }
                }
            });
            shards.push(tx);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = inbound.recv() => {
                    let Some(event) = event else { break };
                    let mut hasher = DefaultHasher::new();
                    event.job_id().hash(&mut hasher);
                    event.node_name().hash(&mut hasher);
                    let shard = (hasher.finish() % shards.len() as u64) as usize;
                    if shards[shard].send(event).await.is_err() {
                        tracing::error!(shard, "Event worker stopped");
                        break;
                    }
                }
                Some(job_id) = expired.recv() => {
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        coordinator.handle_deadline(job_id).await;
                    });
                }
                Some(key) = reorder_expired.recv() => {
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = coordinator
                            .handle_reorder_expiry(key.job_id, &key.node_name, key.channel)
                            .await
                        {
                            tracing::debug!(job_id = %key.job_id, node = %key.node_name, error = %e, "Reorder deadline not applied");
                        }
                    });
                }
            }
        }
        tracing::info!("Dispatch coordinator stopped");
    }

    /// Validate and record a job, then fan the command out in the background.
    pub async fn submit(
        self: &Arc<Self>,
        command: String,
        node_names: Vec<String>,
        quorum: Quorum,
        timeout: Option<Duration>,
    ) -> Result<Uuid> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let job = Job::new(command, node_names, quorum, timeout)?;
        let job_id = job.id;
        let runs: Vec<NodeRun> = job
            .node_names
            .iter()
            .map(|name| NodeRun::new(job_id, name.clone()))
            .collect();

        let entry = Arc::new(JobEntry::new(job.clone(), runs.clone(), &self.config));
        self.persist_job(&entry, &job).await;
        for run in &runs {
            self.persist_run(&entry, run, &[]).await;
        }
        self.jobs.write().await.insert(job_id, entry);
        self.timeouts.schedule(job_id, job.deadline());

        tracing::info!(
            job_id = %job_id,
            nodes = job.node_names.len(),
            quorum = job.quorum,
            timeout_ms = job.timeout.as_millis() as u64,
            "Job submitted"
        );

        let coordinator = self.clone();
        let command = job.command.clone();
        let nodes = job.node_names.clone();
        tokio::spawn(async move {
            coordinator.fan_out(job_id, command, nodes).await;
        });

        Ok(job_id)
    }

    async fn fan_out(self: Arc<Self>, job_id: Uuid, command: String, nodes: Vec<String>) {
        let mut publishes = JoinSet::new();
        for node in nodes {
            let messenger = self.messenger.clone();
            let command = command.clone();
            publishes.spawn(async move {
                let result = messenger.publish(&node, job_id, &command).await;
                (node, result)
            });
        }

        while let Some(joined) = publishes.join_next().await {
            let (node, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Publish task failed");
                    continue;
                }
            };
            match result {
                Ok(()) => tracing::debug!(job_id = %job_id, node = %node, "Command published"),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, node = %node, error = %e, "Dispatch failed");
                    let reason = match e {
                        DispatchError::DispatchFailure { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    let event = RunEvent::DispatchFailed {
                        reason,
                        at: Utc::now(),
                    };
                    if let Err(e) = self.apply_run_event(job_id, &node, event).await {
                        tracing::warn!(job_id = %job_id, node = %node, error = %e, "Could not record dispatch failure");
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> Result<EventOutcome> {
        match event {
            InboundEvent::Ack {
                job_id,
                node_name,
                at,
            } => self.handle_ack(job_id, &node_name, at).await,
            InboundEvent::Started {
                job_id,
                node_name,
                at,
            } => {
                self.apply_run_event(job_id, &node_name, RunEvent::Started { at })
                    .await
            }
            InboundEvent::Output(chunk) => self.handle_output_chunk(chunk).await,
            InboundEvent::Completion {
                job_id,
                node_name,
                exit_status,
                at,
            } => {
                self.handle_completion(job_id, &node_name, exit_status, at)
                    .await
            }
            InboundEvent::Error {
                job_id,
                node_name,
                reason,
                at,
            } => {
                self.apply_run_event(job_id, &node_name, RunEvent::Errored { reason, at })
                    .await
            }
        }
    }

    pub async fn handle_ack(
        &self,
        job_id: Uuid,
        node_name: &str,
        at: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        self.apply_run_event(job_id, node_name, RunEvent::Ack { at })
            .await
    }

    pub async fn handle_completion(
        &self,
        job_id: Uuid,
        node_name: &str,
        exit_status: i32,
        at: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        self.apply_run_event(job_id, node_name, RunEvent::Completed { exit_status, at })
            .await
    }

    pub async fn handle_output_chunk(&self, chunk: OutputChunk) -> Result<EventOutcome> {
        let entry = self.entry(chunk.job_id).await?;
        let slot = entry.slot(&chunk.node_name)?;
        let mut slot = slot.lock().await;

        if slot.run.status.is_terminal() {
            tracing::warn!(
                job_id = %chunk.job_id,
                node = %chunk.node_name,
                sequence = chunk.sequence,
                status = %slot.run.status,
                "Stale output chunk for finished run"
            );
            return Ok(EventOutcome::Stale);
        }

        let channel = chunk.channel;
        let sequence = chunk.sequence;
        let assembled = slot.assembler.accept(chunk);
        slot.sync_reorder_deadline(channel, &self.reorder);
        if assembled.duplicate {
            tracing::debug!(job_id = %entry.id, channel = %channel, sequence, "Duplicate output chunk");
            return Ok(EventOutcome::Unchanged);
        }
        if assembled.segments.is_empty() && !assembled.closed_now {
            tracing::debug!(job_id = %entry.id, channel = %channel, sequence, "Output chunk buffered");
            return Ok(EventOutcome::Output {
                appended: 0,
                data_loss: false,
            });
        }

        let (appended, data_loss) = slot.append(channel, assembled.segments);
        self.persist_slot(&entry, &mut slot).await;
        Ok(EventOutcome::Output {
            appended,
            data_loss,
        })
    }

    /// Flush output held back past its reorder window, without waiting for
    /// another chunk to arrive.
    pub async fn handle_reorder_expiry(
        &self,
        job_id: Uuid,
        node_name: &str,
        channel: OutputChannel,
    ) -> Result<EventOutcome> {
        let entry = self.entry(job_id).await?;
        let slot = entry.slot(node_name)?;
        let mut slot = slot.lock().await;
        slot.armed.remove(&channel);
        if slot.run.status.is_terminal() {
            return Ok(EventOutcome::Stale);
        }

        let assembled = slot.assembler.expire(channel);
        slot.sync_reorder_deadline(channel, &self.reorder);
        if assembled.segments.is_empty() && !assembled.closed_now {
            return Ok(EventOutcome::Unchanged);
        }

        let (appended, data_loss) = slot.append(channel, assembled.segments);
        self.persist_slot(&entry, &mut slot).await;
        tracing::debug!(job_id = %job_id, node = %node_name, channel = %channel, appended, "Reorder window expired");
        Ok(EventOutcome::Output {
            appended,
            data_loss,
        })
    }

    /// Time out every run of `job_id` still in flight.
    pub async fn handle_deadline(&self, job_id: Uuid) {
        let Ok(entry) = self.entry(job_id).await else {
            return;
        };
        let mut timed_out = 0usize;
        for node in entry.runs.keys() {
            match self
                .apply_run_event(job_id, node, RunEvent::TimedOut { at: Utc::now() })
                .await
            {
                Ok(EventOutcome::Moved { .. }) => timed_out += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job_id = %job_id, node = %node, error = %e, "Timeout not applied")
                }
            }
        }
        if timed_out > 0 {
            tracing::info!(job_id = %job_id, timed_out, "Runs timed out");
        }
    }

    /// Cancel the job and every run still in flight. Nodes are told to stop,
    /// best effort and without waiting.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Vec<String>> {
        let entry = self.entry(job_id).await?;
        let node_names = {
            let mut state = entry.state.lock().await;
            if state.job.transition(JobStatus::Cancelled, Utc::now()) {
                self.persist_job(&entry, &state.job).await;
                tracing::info!(job_id = %job_id, "Job cancelled");
            }
            state.job.node_names.clone()
        };

        let cancelled = self
            .cancel_nodes(&entry, &node_names, "job cancelled")
            .await;
        self.timeouts.clear(job_id);
        Ok(cancelled)
    }

    /// Cancel only the listed runs; the job's fate is left to the quorum.
    pub async fn cancel_runs(&self, job_id: Uuid, node_names: &[String]) -> Result<Vec<String>> {
        let entry = self.entry(job_id).await?;
        if let Some(unknown) = node_names.iter().find(|n| !entry.runs.contains_key(*n)) {
            return Err(DispatchError::invalid(format!(
                "node {unknown} is not part of job {job_id}"
            )));
        }
        Ok(self
            .cancel_nodes(&entry, node_names, "cancelled by operator")
            .await)
    }

    async fn cancel_nodes(&self, entry: &JobEntry, node_names: &[String], reason: &str) -> Vec<String> {
        let mut cancelled = Vec::new();
        for node in node_names {
            let event = RunEvent::Cancelled {
                reason: reason.to_string(),
                at: Utc::now(),
            };
            match self.apply_run_event(entry.id, node, event).await {
                Ok(EventOutcome::Moved { .. }) => {
                    cancelled.push(node.clone());
                    let messenger = self.messenger.clone();
                    let node = node.clone();
                    let job_id = entry.id;
                    tokio::spawn(async move {
                        if let Err(e) = messenger.cancel(&node, job_id).await {
                            tracing::debug!(job_id = %job_id, node = %node, error = %e, "Cancel notification not delivered");
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(job_id = %entry.id, node = %node, error = %e, "Cancel not applied"),
            }
        }
        cancelled
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobView> {
        let entry = self.entry(job_id).await?;
        Ok(Self::view(&entry).await)
    }

    /// Every job, oldest first.
    pub async fn list(&self) -> Vec<JobView> {
        let entries: Vec<Arc<JobEntry>> = self.jobs.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            views.push(Self::view(&entry).await);
        }
        views.sort_by_key(|v| v.job.created_at);
        views
    }

    pub async fn watch_output(&self, job_id: Uuid, node_name: &str) -> Result<OutputWatch> {
        let entry = self.entry(job_id).await?;
        let slot = entry.slot(node_name)?;
        let slot = slot.lock().await;
        Ok(OutputWatch {
            output: slot.run.output.clone(),
            error_output: slot.run.error_output.clone(),
            finished: slot.run.status.is_terminal(),
            updates: slot.watchers.subscribe(),
        })
    }

    /// Load stored jobs that are not in memory yet, rebuild their status from
    /// their runs and re-arm deadlines for runs still in flight.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = with_retry(&self.config.retry, "list jobs", || self.store.list_jobs()).await?;
        let mut recovered = 0;

        for mut job in jobs {
            if self.jobs.read().await.contains_key(&job.id) {
                continue;
            }
            let job_id = job.id;
            let mut stored: HashMap<String, NodeRun> =
                with_retry(&self.config.retry, "load node runs", || {
                    self.store.load_node_runs(job_id)
                })
                .await?
                .into_iter()
                .map(|r| (r.node_name.clone(), r))
                .collect();
            let runs: Vec<NodeRun> = job
                .node_names
                .iter()
                .map(|name| {
                    stored
                        .remove(name)
                        .unwrap_or_else(|| NodeRun::new(job_id, name.clone()))
                })
                .collect();

            let derived = quorum::derive_status(job.quorum, runs.iter().map(|r| r.status));
            let changed = job.transition(derived, Utc::now());
            let in_flight = runs.iter().any(|r| !r.status.is_terminal());

            let entry = Arc::new(JobEntry::new(job.clone(), runs, &self.config));
            if changed {
                self.persist_job(&entry, &job).await;
            }
            self.jobs.write().await.insert(job_id, entry);
            if in_flight {
                self.timeouts.schedule(job_id, job.deadline());
            }
            tracing::info!(job_id = %job_id, status = %job.status, in_flight, "Job recovered");
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn entry(&self, job_id: Uuid) -> Result<Arc<JobEntry>> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(job_id))
    }

    async fn view(entry: &JobEntry) -> JobView {
        let job = entry.state.lock().await.job.clone();
        let mut runs = Vec::with_capacity(job.node_names.len());
        for node in &job.node_names {
            if let Some(slot) = entry.runs.get(node) {
                runs.push(slot.lock().await.run.clone());
            }
        }
        JobView {
            job,
            runs,
            persistence_degraded: entry.degraded.load(Ordering::SeqCst),
        }
    }

    async fn apply_run_event(
        &self,
        job_id: Uuid,
        node_name: &str,
        event: RunEvent,
    ) -> Result<EventOutcome> {
        let entry = self.entry(job_id).await?;
        let slot = entry.slot(node_name)?;

        let (from, to) = {
            let mut slot = slot.lock().await;
            if event.is_terminal() && !slot.run.status.is_terminal() {
                for (channel, assembled) in slot.assembler.finish() {
                    slot.append(channel, assembled.segments);
                }
                for channel in [OutputChannel::Stdout, OutputChannel::Stderr] {
                    slot.sync_reorder_deadline(channel, &self.reorder);
                }
            }

            match slot.run.apply(&event) {
                Transition::Stale => {
                    tracing::warn!(
                        job_id = %job_id,
                        node = %node_name,
                        status = %slot.run.status,
                        event = ?event,
                        "Stale event for finished run"
                    );
                    return Ok(EventOutcome::Stale);
                }
                Transition::Unchanged => {
                    tracing::debug!(job_id = %job_id, node = %node_name, "Duplicate run event");
                    return Ok(EventOutcome::Unchanged);
                }
                Transition::Moved { from, to } => {
                    self.persist_slot(&entry, &mut slot).await;
                    if to.is_terminal() {
                        let _ = slot.watchers.send(TranscriptEvent::End);
                    }
                    (from, to)
                }
            }
        };

        if to.is_terminal() {
            tracing::info!(job_id = %job_id, node = %node_name, from = %from, to = %to, "Run finished");
        } else {
            tracing::debug!(job_id = %job_id, node = %node_name, from = %from, to = %to, "Run transition");
        }

        self.reevaluate(&entry, node_name, to).await;
        Ok(EventOutcome::Moved { from, to })
    }

    /// Fold a run's new status into its job and re-run the quorum check.
    async fn reevaluate(&self, entry: &JobEntry, node_name: &str, status: RunStatus) {
        let mut state = entry.state.lock().await;
        let known = state
            .statuses
            .get(node_name)
            .copied()
            .unwrap_or(RunStatus::Invited);
        if rank(status) > rank(known) {
            state.statuses.insert(node_name.to_string(), status);
        }

        if state.statuses.values().all(|s| s.is_terminal()) {
            self.timeouts.clear(entry.id);
        }
        if state.job.status.is_terminal() {
            return;
        }

        let derived = quorum::derive_status(state.job.quorum, state.statuses.values().copied());
        let previous = state.job.status;
        if state.job.transition(derived, Utc::now()) {
            self.persist_job(entry, &state.job).await;
            match derived {
                JobStatus::Complete | JobStatus::Failed => tracing::info!(
                    job_id = %entry.id,
                    from = %previous,
                    to = %derived,
                    "Job finished"
                ),
                _ => tracing::debug!(job_id = %entry.id, from = %previous, to = %derived, "Job transition"),
            }
        }
    }

    async fn persist_job(&self, entry: &JobEntry, job: &Job) {
        if let Err(e) = with_retry(&self.config.retry, "save job", || self.store.save_job(job)).await
        {
            entry.degraded.store(true, Ordering::SeqCst);
            tracing::error!(job_id = %job.id, status = %job.status, error = %e, "Job not persisted, state kept in memory");
        }
    }

    /// Save the slot's run with the transcript pieces not stored yet. Pieces
    /// that fail to save are sent again with the next save.
    async fn persist_slot(&self, entry: &JobEntry, slot: &mut RunSlot) {
        if self.persist_run(entry, &slot.run, &slot.unsaved).await {
            slot.unsaved.clear();
        }
    }

    async fn persist_run(&self, entry: &JobEntry, run: &NodeRun, appended: &[OutputPiece]) -> bool {
        match with_retry(&self.config.retry, "save node run", || {
            self.store.save_node_run(run, appended)
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                entry.degraded.store(true, Ordering::SeqCst);
                tracing::error!(
                    job_id = %run.job_id,
                    node = %run.node_name,
                    status = %run.status,
                    unsaved_pieces = appended.len(),
                    error = %e,
                    "Node run not persisted, state kept in memory"
                );
                false
            }
        }
    }
}
