use std::process::Stdio;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::output::{OutputChannel, OutputChunk};
use crate::messaging::InboundEvent;

/// How a command ended on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Exited { exit_status: i32 },
    Cancelled,
    /// The process could not be started or waited on.
    Error { reason: String },
}

/// Runs shell commands and streams their output back as numbered chunks.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    node_name: String,
    chunk_size: usize,
}

impl CommandExecutor {
    pub fn new(node_name: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            node_name: node_name.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run `sh -c <command>`, sending every chunk of stdout and stderr to
    /// `events` followed by the completion or error report. Cancelling
    /// `cancel` kills the process; nothing is reported after that.
    pub async fn execute(
        &self,
        job_id: Uuid,
        command: &str,
        events: mpsc::Sender<InboundEvent>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(job_id = %job_id, node = %self.node_name, command, "Executing command");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to start command: {e}");
                tracing::error!(job_id = %job_id, node = %self.node_name, error = %e, "Command not started");
                self.report(
                    &events,
                    InboundEvent::Error {
                        job_id,
                        node_name: self.node_name.clone(),
                        reason: reason.clone(),
                        at: Utc::now(),
                    },
                )
                .await;
                return ExecutionResult::Error { reason };
            }
        };

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().stream(
                job_id,
                OutputChannel::Stdout,
                stdout,
                events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().stream(
                job_id,
                OutputChannel::Stderr,
                stderr,
                events.clone(),
            )));
        }

        let waited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let status = match waited {
            None => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job_id, node = %self.node_name, error = %e, "Failed to kill command");
                }
                for reader in readers {
                    reader.abort();
                }
                tracing::info!(job_id = %job_id, node = %self.node_name, "Command killed");
                return ExecutionResult::Cancelled;
            }
            Some(status) => status,
        };

        // Output must be fully sent before the completion.
        for reader in readers {
            let _ = reader.await;
        }

        match status {
            Ok(status) => {
                let exit_status = status.code().unwrap_or(-1);
                tracing::info!(job_id = %job_id, node = %self.node_name, exit_status, "Command completed");
                self.report(
                    &events,
                    InboundEvent::Completion {
                        job_id,
                        node_name: self.node_name.clone(),
                        exit_status,
                        at: Utc::now(),
                    },
                )
                .await;
                ExecutionResult::Exited { exit_status }
            }
            Err(e) => {
                let reason = format!("failed to wait for command: {e}");
                tracing::error!(job_id = %job_id, node = %self.node_name, error = %e, "Command lost");
                self.report(
                    &events,
                    InboundEvent::Error {
                        job_id,
                        node_name: self.node_name.clone(),
                        reason: reason.clone(),
                        at: Utc::now(),
                    },
                )
                .await;
                ExecutionResult::Error { reason }
            }
        }
    }

    async fn stream<R>(
        self,
        job_id: Uuid,
        channel: OutputChannel,
        mut reader: R,
        events: mpsc::Sender<InboundEvent>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut sequence = 0u64;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let (payload, is_final) = match reader.read(&mut buf).await {
                Ok(0) => (Vec::new(), true),
                Ok(n) => (buf[..n].to_vec(), false),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, channel = %channel, error = %e, "Output read failed");
                    (Vec::new(), true)
                }
            };
            let chunk = OutputChunk {
                job_id,
                node_name: self.node_name.clone(),
                sequence,
                channel,
                payload,
                is_final,
            };
            if events.send(InboundEvent::Output(chunk)).await.is_err() || is_final {
                break;
            }
            sequence += 1;
        }
    }

    async fn report(&self, events: &mpsc::Sender<InboundEvent>, event: InboundEvent) {
        let kind = event.kind();
        if events.send(event).await.is_err() {
            tracing::warn!(node = %self.node_name, kind, "Dispatcher gone, report dropped");
        }
    }
}
