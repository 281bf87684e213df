//! Job dispatch: fan a command out to nodes, track each node's run and
//! decide the job's outcome from a quorum.
//!
//! # Components
//!
//! - [`Job`] and [`NodeRun`]: the records and their status machines
//! - [`OutputAssembler`]: reorders and deduplicates streamed output
//! - [`quorum`]: pure quorum arithmetic
//! - [`TimeoutSupervisor`]: job deadlines and output reorder windows
//! - [`DispatchCoordinator`]: applies every event and owns all state
//!
//! # Event flow
//!
//! 1. `submit` validates, persists and publishes to every node
//! 2. Nodes report ack, output chunks and completion through the messenger
//! 3. Each event is applied to its run under the run's lock, then persisted
//! 4. The job status is re-derived from the runs after every transition
//! 5. At the deadline, runs still in flight become `NackTimedOut`
//! 6. Output held back behind a hole is flushed once its reorder window ends

pub mod coordinator;
pub mod job;
pub mod output;
pub mod quorum;
pub mod run;
pub mod timeout;

pub use coordinator::{
    CoordinatorDriver, DispatchCoordinator, EventOutcome, JobView, OutputWatch, TranscriptEvent,
};
pub use job::{Job, JobStatus, Quorum};
pub use output::{
    ChannelCursor, GapReason, OutputAssembler, OutputChannel, OutputChunk, OutputGap,
    OutputLimits,
};
pub use run::{NodeRun, RunEvent, RunStatus};
pub use timeout::{TimeoutHandle, TimeoutSupervisor};
