//! Reassembly of streamed node output.
//!
//! Nodes send their stdout and stderr as numbered chunks, one sequence per
//! channel starting at 0. Delivery is at-least-once and may reorder chunks,
//! so each channel keeps the next expected sequence and a bounded buffer of
//! chunks that arrived early. The assembler never touches a [`NodeRun`]
//! itself: it hands back the segments to append and the updated cursor, and
//! the coordinator applies them under the run's lock.
//!
//! [`NodeRun`]: crate::dispatch::run::NodeRun

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputChannel::Stdout => write!(f, "stdout"),
            OutputChannel::Stderr => write!(f, "stderr"),
        }
    }
}

impl FromStr for OutputChannel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(OutputChannel::Stdout),
            "stderr" => Ok(OutputChannel::Stderr),
            other => Err(DispatchError::invalid(format!(
                "unknown output channel {other:?}"
            ))),
        }
    }
}

/// One numbered fragment of a node's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub job_id: Uuid,
    pub node_name: String,
    pub sequence: u64,
    pub channel: OutputChannel,
    pub payload: Vec<u8>,
    pub is_final: bool,
}

/// Where a channel's reassembly stands. Persisted with the run so a restored
/// coordinator keeps discarding replays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCursor {
    pub next_sequence: u64,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapReason {
    BufferFull,
    BufferExpired,
    RunFinished,
}

impl std::fmt::Display for GapReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GapReason::BufferFull => write!(f, "reorder buffer full"),
            GapReason::BufferExpired => write!(f, "reorder buffer expired"),
            GapReason::RunFinished => write!(f, "run finished"),
        }
    }
}

/// Sequences `missing_from..=missing_to` never arrived; the transcript
/// carries a loss marker at byte `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGap {
    pub channel: OutputChannel,
    pub missing_from: u64,
    pub missing_to: u64,
    pub offset: u64,
    pub reason: GapReason,
}

/// A piece of transcript produced by the assembler, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Data(Vec<u8>),
    Loss {
        missing_from: u64,
        missing_to: u64,
        reason: GapReason,
    },
}

impl Segment {
    /// Bytes this segment contributes to the transcript.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Segment::Data(bytes) => bytes.clone(),
            Segment::Loss {
                missing_from,
                missing_to,
                reason,
            } => loss_marker(*missing_from, *missing_to, *reason).into_bytes(),
        }
    }
}

pub fn loss_marker(missing_from: u64, missing_to: u64, reason: GapReason) -> String {
    if missing_from == missing_to {
        format!("\n[output lost: chunk {missing_from} missing, {reason}]\n")
    } else {
        format!("\n[output lost: chunks {missing_from}-{missing_to} missing, {reason}]\n")
    }
}

/// Limits on the out-of-order buffer of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimits {
    pub max_buffered_chunks: usize,
    pub max_buffer_age: Duration,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_buffered_chunks: 256,
            max_buffer_age: Duration::from_secs(30),
        }
    }
}

/// What one call into the assembler produced for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assembled {
    pub segments: Vec<Segment>,
    pub duplicate: bool,
    pub closed_now: bool,
}

impl Assembled {
    pub fn has_loss(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Loss { .. }))
    }
}

#[derive(Debug)]
struct Buffered {
    payload: Vec<u8>,
    is_final: bool,
}

#[derive(Debug)]
struct ChannelState {
    cursor: ChannelCursor,
    pending: BTreeMap<u64, Buffered>,
    oldest: Option<Instant>,
}

impl ChannelState {
    fn new(cursor: ChannelCursor) -> Self {
        Self {
            cursor,
            pending: BTreeMap::new(),
            oldest: None,
        }
    }

    fn accept(&mut self, chunk: OutputChunk, limits: &OutputLimits, now: Instant) -> Assembled {
        let mut out = Assembled::default();
        if self.cursor.closed
            || chunk.sequence < self.cursor.next_sequence
            || self.pending.contains_key(&chunk.sequence)
        {
            out.duplicate = true;
            return out;
        }

        if chunk.sequence > self.cursor.next_sequence {
            self.pending.insert(
                chunk.sequence,
                Buffered {
                    payload: chunk.payload,
                    is_final: chunk.is_final,
                },
            );
            self.oldest.get_or_insert(now);

            if self.pending.len() > limits.max_buffered_chunks {
                self.skip_gap(GapReason::BufferFull, &mut out);
            } else if self.deadline(limits).is_some_and(|at| now >= at) {
                self.skip_gap(GapReason::BufferExpired, &mut out);
            }
        } else {
            self.apply(chunk.payload, chunk.is_final, &mut out);
        }

        self.drain(&mut out);
        self.restart_clock(now);
        out
    }

    fn deadline(&self, limits: &OutputLimits) -> Option<Instant> {
        self.oldest.map(|t| t + limits.max_buffer_age)
    }

    fn expire(&mut self, limits: &OutputLimits, now: Instant) -> Assembled {
        let mut out = Assembled::default();
        if self.deadline(limits).is_some_and(|at| now >= at) {
            self.skip_gap(GapReason::BufferExpired, &mut out);
            self.drain(&mut out);
            self.restart_clock(now);
        }
        out
    }

    /// Chunks still buffered behind a further hole wait a full window again.
    fn restart_clock(&mut self, now: Instant) {
        if !self.pending.is_empty() && self.oldest.is_none() {
            self.oldest = Some(now);
        }
    }

    fn apply(&mut self, payload: Vec<u8>, is_final: bool, out: &mut Assembled) {
        if !payload.is_empty() {
            out.segments.push(Segment::Data(payload));
        }
        self.cursor.next_sequence += 1;
        if is_final {
            self.cursor.closed = true;
            out.closed_now = true;
            // Anything numbered past the final chunk is noise.
            self.pending.clear();
        }
    }

    fn drain(&mut self, out: &mut Assembled) {
        while !self.cursor.closed {
            let Some(next) = self.pending.remove(&self.cursor.next_sequence) else {
                break;
            };
            self.apply(next.payload, next.is_final, out);
        }
        if self.pending.is_empty() {
            self.oldest = None;
        }
    }

    /// Jump the cursor over the hole in front of the lowest buffered chunk.
    fn skip_gap(&mut self, reason: GapReason, out: &mut Assembled) {
        let Some(&first) = self.pending.keys().next() else {
            return;
        };
        out.segments.push(Segment::Loss {
            missing_from: self.cursor.next_sequence,
            missing_to: first - 1,
            reason,
        });
        self.cursor.next_sequence = first;
        self.oldest = None;
    }

    fn flush(&mut self, reason: GapReason) -> Assembled {
        let mut out = Assembled::default();
        while !self.pending.is_empty() && !self.cursor.closed {
            self.skip_gap(reason, &mut out);
            self.drain(&mut out);
        }
        self.pending.clear();
        self.oldest = None;
        out
    }
}

/// Reassembles both output channels of one node run.
#[derive(Debug)]
pub struct OutputAssembler {
    limits: OutputLimits,
    stdout: ChannelState,
    stderr: ChannelState,
}

impl OutputAssembler {
    pub fn new(limits: OutputLimits) -> Self {
        Self::resume(limits, ChannelCursor::default(), ChannelCursor::default())
    }

    /// Continue from persisted cursors.
    pub fn resume(limits: OutputLimits, stdout: ChannelCursor, stderr: ChannelCursor) -> Self {
        Self {
            limits,
            stdout: ChannelState::new(stdout),
            stderr: ChannelState::new(stderr),
        }
    }

    fn channel(&self, channel: OutputChannel) -> &ChannelState {
        match channel {
            OutputChannel::Stdout => &self.stdout,
            OutputChannel::Stderr => &self.stderr,
        }
    }

    fn channel_mut(&mut self, channel: OutputChannel) -> &mut ChannelState {
        match channel {
            OutputChannel::Stdout => &mut self.stdout,
            OutputChannel::Stderr => &mut self.stderr,
        }
    }

    pub fn cursor(&self, channel: OutputChannel) -> ChannelCursor {
        self.channel(channel).cursor
    }

    pub fn buffered(&self, channel: OutputChannel) -> usize {
        self.channel(channel).pending.len()
    }

    /// When the oldest chunk buffered on `channel` stops being waited for.
    /// `None` while nothing is buffered.
    pub fn reorder_deadline(&self, channel: OutputChannel) -> Option<Instant> {
        self.channel(channel).deadline(&self.limits)
    }

    /// Flush `channel` across its gap once its reorder deadline has passed.
    /// Returns nothing if the deadline is not due.
    pub fn expire(&mut self, channel: OutputChannel) -> Assembled {
        self.expire_at(channel, Instant::now())
    }

    pub fn expire_at(&mut self, channel: OutputChannel, now: Instant) -> Assembled {
        let limits = self.limits;
        self.channel_mut(channel).expire(&limits, now)
    }

    pub fn accept(&mut self, chunk: OutputChunk) -> Assembled {
        self.accept_at(chunk, Instant::now())
    }

    pub fn accept_at(&mut self, chunk: OutputChunk, now: Instant) -> Assembled {
        let limits = self.limits;
        self.channel_mut(chunk.channel).accept(chunk, &limits, now)
    }

    /// Give up on missing chunks of both channels, keeping what arrived in
    /// order. Used when the run reaches a terminal status.
    pub fn finish(&mut self) -> Vec<(OutputChannel, Assembled)> {
        [OutputChannel::Stdout, OutputChannel::Stderr]
            .into_iter()
            .map(|channel| {
                (
                    channel,
                    self.channel_mut(channel).flush(GapReason::RunFinished),
                )
            })
            .filter(|(_, assembled)| !assembled.segments.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u64, payload: &str, is_final: bool) -> OutputChunk {
        OutputChunk {
            job_id: Uuid::nil(),
            node_name: "web1".to_string(),
            sequence,
            channel: OutputChannel::Stdout,
            payload: payload.as_bytes().to_vec(),
            is_final,
        }
    }

    fn text(segments: &[Segment]) -> String {
        let bytes: Vec<u8> = segments.iter().flat_map(|s| s.bytes()).collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn reorders_out_of_order_chunks() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        let mut transcript = Vec::new();

        for c in [chunk(1, "b", false), chunk(0, "a", false), chunk(2, "c", true)] {
            transcript.extend(asm.accept(c).segments);
        }

        assert_eq!(text(&transcript), "abc");
        let cursor = asm.cursor(OutputChannel::Stdout);
        assert_eq!(cursor.next_sequence, 3);
        assert!(cursor.closed);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        assert_eq!(text(&asm.accept(chunk(0, "a", false)).segments), "a");

        let again = asm.accept(chunk(0, "a", false));
        assert!(again.duplicate);
        assert!(again.segments.is_empty());

        asm.accept(chunk(2, "c", false));
        assert!(asm.accept(chunk(2, "c", false)).duplicate);
        assert_eq!(asm.buffered(OutputChannel::Stdout), 1);
    }

    #[test]
    fn final_chunk_waits_for_gap() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        asm.accept(chunk(0, "a", false));

        let early_final = asm.accept(chunk(2, "c", true));
        assert!(!early_final.closed_now);
        assert!(!asm.cursor(OutputChannel::Stdout).closed);

        let filled = asm.accept(chunk(1, "b", false));
        assert_eq!(text(&filled.segments), "bc");
        assert!(filled.closed_now);
    }

    #[test]
    fn chunks_after_close_are_dropped() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        asm.accept(chunk(0, "done", true));
        assert!(asm.accept(chunk(1, "extra", false)).duplicate);
    }

    #[test]
    fn channels_are_independent() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        let mut err = chunk(0, "oops", false);
        err.channel = OutputChannel::Stderr;

        assert_eq!(text(&asm.accept(chunk(0, "ok", false)).segments), "ok");
        assert_eq!(text(&asm.accept(err).segments), "oops");
        assert_eq!(asm.cursor(OutputChannel::Stdout).next_sequence, 1);
        assert_eq!(asm.cursor(OutputChannel::Stderr).next_sequence, 1);
    }

    #[test]
    fn full_buffer_forces_gap() {
        let limits = OutputLimits {
            max_buffered_chunks: 2,
            max_buffer_age: Duration::from_secs(60),
        };
        let mut asm = OutputAssembler::new(limits);
        asm.accept(chunk(0, "a", false));
        assert!(asm.accept(chunk(2, "c", false)).segments.is_empty());
        assert!(asm.accept(chunk(3, "d", false)).segments.is_empty());

        let forced = asm.accept(chunk(4, "e", false));
        assert!(forced.has_loss());
        assert_eq!(
            forced.segments[0],
            Segment::Loss {
                missing_from: 1,
                missing_to: 1,
                reason: GapReason::BufferFull
            }
        );
        assert!(text(&forced.segments).ends_with("cde"));

        // The missing chunk is now behind the cursor.
        assert!(asm.accept(chunk(1, "b", false)).duplicate);
    }

    #[test]
    fn old_buffer_forces_gap() {
        let limits = OutputLimits {
            max_buffered_chunks: 100,
            max_buffer_age: Duration::from_secs(5),
        };
        let mut asm = OutputAssembler::new(limits);
        let start = Instant::now();

        assert!(asm
            .accept_at(chunk(1, "b", false), start)
            .segments
            .is_empty());
        let forced = asm.accept_at(chunk(2, "c", false), start + Duration::from_secs(6));
        assert!(forced.has_loss());
        assert!(text(&forced.segments).ends_with("bc"));
    }

    #[test]
    fn expire_waits_for_the_deadline() {
        let limits = OutputLimits {
            max_buffered_chunks: 100,
            max_buffer_age: Duration::from_secs(5),
        };
        let mut asm = OutputAssembler::new(limits);
        let start = Instant::now();
        assert_eq!(asm.reorder_deadline(OutputChannel::Stdout), None);

        asm.accept_at(chunk(0, "a", false), start);
        asm.accept_at(chunk(2, "c", false), start);
        let deadline = asm.reorder_deadline(OutputChannel::Stdout).unwrap();
        assert_eq!(deadline, start + Duration::from_secs(5));

        let early = asm.expire_at(OutputChannel::Stdout, start + Duration::from_secs(4));
        assert!(early.segments.is_empty());
        assert_eq!(asm.buffered(OutputChannel::Stdout), 1);

        let flushed = asm.expire_at(OutputChannel::Stdout, deadline);
        assert_eq!(
            flushed.segments[0],
            Segment::Loss {
                missing_from: 1,
                missing_to: 1,
                reason: GapReason::BufferExpired
            }
        );
        assert!(text(&flushed.segments).ends_with('c'));
        assert_eq!(asm.cursor(OutputChannel::Stdout).next_sequence, 3);
        assert_eq!(asm.reorder_deadline(OutputChannel::Stdout), None);
    }

    #[test]
    fn expire_restarts_window_for_later_holes() {
        let limits = OutputLimits {
            max_buffered_chunks: 100,
            max_buffer_age: Duration::from_secs(5),
        };
        let mut asm = OutputAssembler::new(limits);
        let start = Instant::now();
        asm.accept_at(chunk(1, "b", false), start);
        asm.accept_at(chunk(4, "e", false), start);

        let later = start + Duration::from_secs(5);
        let flushed = asm.expire_at(OutputChannel::Stdout, later);
        assert!(text(&flushed.segments).ends_with('b'));
        assert_eq!(asm.buffered(OutputChannel::Stdout), 1);
        assert_eq!(
            asm.reorder_deadline(OutputChannel::Stdout),
            Some(later + Duration::from_secs(5))
        );
    }

    #[test]
    fn finish_flushes_around_holes() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        asm.accept(chunk(0, "a", false));
        asm.accept(chunk(2, "c", false));
        asm.accept(chunk(5, "f", false));

        let flushed = asm.finish();
        assert_eq!(flushed.len(), 1);
        let (channel, assembled) = &flushed[0];
        assert_eq!(*channel, OutputChannel::Stdout);

        let losses: Vec<_> = assembled
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::Loss {
                    missing_from,
                    missing_to,
                    ..
                } => Some((*missing_from, *missing_to)),
                _ => None,
            })
            .collect();
        assert_eq!(losses, vec![(1, 1), (3, 4)]);
        let rendered = text(&assembled.segments);
        assert!(rendered.contains("chunk 1 missing"));
        assert!(rendered.contains("chunks 3-4 missing"));
    }

    #[test]
    fn finish_without_holes_is_empty() {
        let mut asm = OutputAssembler::new(OutputLimits::default());
        asm.accept(chunk(0, "a", true));
        assert!(asm.finish().is_empty());
    }

    #[test]
    fn resume_discards_replayed_chunks() {
        let cursor = ChannelCursor {
            next_sequence: 3,
            closed: false,
        };
        let mut asm =
            OutputAssembler::resume(OutputLimits::default(), cursor, ChannelCursor::default());
        assert!(asm.accept(chunk(1, "b", false)).duplicate);
        assert_eq!(text(&asm.accept(chunk(3, "d", false)).segments), "d");
    }
}
