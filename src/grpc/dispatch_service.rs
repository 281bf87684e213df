use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::dispatch::{
    DispatchCoordinator, JobStatus, JobView, NodeRun, OutputChannel, OutputGap, Quorum, RunStatus,
    TranscriptEvent,
};
use crate::proto::dispatch_service_server::DispatchService;
use crate::proto::{
    self, CancelJobRequest, CancelJobResponse, GetJobStatusRequest, ListJobsRequest,
    ListJobsResponse, OutputFrame, StreamOutputRequest, SubmitJobRequest, SubmitJobResponse,
};

/// gRPC front of the dispatch coordinator.
pub struct DispatchGrpcService {
    coordinator: Arc<DispatchCoordinator>,
}

impl DispatchGrpcService {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self { coordinator }
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("Invalid job ID"))
}

pub fn job_status_to_proto(status: JobStatus) -> proto::JobStatus {
    match status {
        JobStatus::Submitted => proto::JobStatus::Submitted,
        JobStatus::Running => proto::JobStatus::Running,
        JobStatus::Complete => proto::JobStatus::Complete,
        JobStatus::Failed => proto::JobStatus::Failed,
        JobStatus::Cancelled => proto::JobStatus::Cancelled,
    }
}

pub fn run_status_to_proto(status: RunStatus) -> proto::RunStatus {
    match status {
        RunStatus::Invited => proto::RunStatus::Invited,
        RunStatus::Acked => proto::RunStatus::Acked,
        RunStatus::Running => proto::RunStatus::Running,
        RunStatus::Succeeded => proto::RunStatus::Succeeded,
        RunStatus::Failed => proto::RunStatus::Failed,
        RunStatus::NackTimedOut => proto::RunStatus::NackTimedOut,
        RunStatus::Cancelled => proto::RunStatus::Cancelled,
    }
}

fn channel_to_proto(channel: OutputChannel) -> proto::OutputChannel {
    match channel {
        OutputChannel::Stdout => proto::OutputChannel::Stdout,
        OutputChannel::Stderr => proto::OutputChannel::Stderr,
    }
}

fn gap_to_proto(gap: &OutputGap) -> proto::OutputGap {
    proto::OutputGap {
        channel: channel_to_proto(gap.channel) as i32,
        missing_from: gap.missing_from,
        missing_to: gap.missing_to,
        offset: gap.offset,
        reason: gap.reason.to_string(),
    }
}

fn run_to_proto(run: &NodeRun) -> proto::NodeRunView {
    proto::NodeRunView {
        node_name: run.node_name.clone(),
        status: run_status_to_proto(run.status) as i32,
        ack_time_ms: run.ack_time.map(|t| t.timestamp_millis()),
        end_time_ms: run.end_time.map(|t| t.timestamp_millis()),
        exit_status: run.exit_status,
        output: String::from_utf8_lossy(&run.output).into_owned(),
        error_output: String::from_utf8_lossy(&run.error_output).into_owned(),
        error: run.error.clone().unwrap_or_default(),
        gaps: run.gaps.iter().map(gap_to_proto).collect(),
    }
}

pub fn job_view_to_proto(view: &JobView) -> proto::JobView {
    let job = &view.job;
    proto::JobView {
        job_id: job.id.to_string(),
        command: job.command.clone(),
        status: job_status_to_proto(job.status) as i32,
        quorum_spec: job.quorum_spec.to_string(),
        quorum: job.quorum as u32,
        timeout_ms: job.timeout.as_millis() as u64,
        created_at_ms: job.created_at.timestamp_millis(),
        updated_at_ms: job.updated_at.timestamp_millis(),
        persistence_degraded: view.persistence_degraded,
        runs: view.runs.iter().map(run_to_proto).collect(),
    }
}

type OutputStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<OutputFrame, Status>> + Send>>;

#[tonic::async_trait]
impl DispatchService for DispatchGrpcService {
    type StreamOutputStream = OutputStream;

    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();

        let quorum: Quorum = if req.quorum.trim().is_empty() {
            Quorum::all()
        } else {
            req.quorum.parse()?
        };
        let timeout = (req.timeout_ms > 0).then(|| Duration::from_millis(req.timeout_ms));

        let job_id = self
            .coordinator
            .submit(req.command, req.node_names, quorum, timeout)
            .await?;
        let view = self.coordinator.status(job_id).await?;

        Ok(Response::new(SubmitJobResponse {
            job_id: job_id.to_string(),
            created_at_ms: view.job.created_at.timestamp_millis(),
            quorum: view.job.quorum as u32,
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = parse_job_id(&req.job_id)?;

        let cancelled_nodes = if req.node_names.is_empty() {
            self.coordinator.cancel(job_id).await?
        } else {
            self.coordinator
                .cancel_runs(job_id, &req.node_names)
                .await?
        };

        Ok(Response::new(CancelJobResponse { cancelled_nodes }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<proto::JobView>, Status> {
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let view = self.coordinator.status(job_id).await?;
        Ok(Response::new(job_view_to_proto(&view)))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self
            .coordinator
            .list()
            .await
            .iter()
            .map(job_view_to_proto)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn stream_output(
        &self,
        request: Request<StreamOutputRequest>,
    ) -> Result<Response<Self::StreamOutputStream>, Status> {
        let req = request.into_inner();
        let job_id = parse_job_id(&req.job_id)?;
        let mut watch = self
            .coordinator
            .watch_output(job_id, &req.node_name)
            .await?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            let backlog = [
                (OutputChannel::Stdout, std::mem::take(&mut watch.output)),
                (OutputChannel::Stderr, std::mem::take(&mut watch.error_output)),
            ];
            for (channel, payload) in backlog {
                if payload.is_empty() {
                    continue;
                }
                let frame = OutputFrame {
                    channel: channel_to_proto(channel) as i32,
                    payload,
                    loss_marker: false,
                    end: false,
                };
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }

            if !watch.finished {
                loop {
                    let frame = match watch.updates.recv().await {
                        Ok(TranscriptEvent::Append {
                            channel,
                            bytes,
                            loss_marker,
                        }) => OutputFrame {
                            channel: channel_to_proto(channel) as i32,
                            payload: bytes,
                            loss_marker,
                            end: false,
                        },
                        Ok(TranscriptEvent::End) | Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(job_id = %job_id, skipped, "Output stream lagged");
                            let _ = tx
                                .send(Err(Status::data_loss(format!(
                                    "output stream fell behind by {skipped} updates"
                                ))))
                                .await;
                            return;
                        }
                    };
                    if tx.send(Ok(frame)).await.is_err() {
                        // Client disconnected
                        return;
                    }
                }
            }

            let _ = tx
                .send(Ok(OutputFrame {
                    channel: proto::OutputChannel::Stdout as i32,
                    payload: Vec::new(),
                    loss_marker: false,
                    end: true,
                }))
                .await;
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::StreamOutputStream))
    }
}
