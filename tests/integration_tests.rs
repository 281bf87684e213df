//! End-to-end tests: a dispatcher process with in-process node agents,
//! driven over gRPC on a real port.

mod test_harness;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use fleet_dispatch::config::{ServerConfig, StoreBackend};
use fleet_dispatch::error::Result;
use fleet_dispatch::proto::dispatch_service_client::DispatchServiceClient;
use fleet_dispatch::proto::{
    self, CancelJobRequest, GetJobStatusRequest, StreamOutputRequest, SubmitJobRequest,
};
use fleet_dispatch::server::DispatchServer;
use test_harness::assert_eventually;

struct RunningServer {
    client: DispatchServiceClient<Channel>,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    async fn start(port: u16, nodes: &[&str], store: StoreBackend) -> Self {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let mut config = ServerConfig::new(addr).with_store(store);
        for node in nodes {
            config = config.with_local_node(*node);
        }
        config.agent_chunk_size = 256;

        let server = DispatchServer::new(config).expect("server should build");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let endpoint = format!("http://{addr}");
        let mut attempts = 0;
        let client = loop {
            match DispatchServiceClient::connect(endpoint.clone()).await {
                Ok(client) => break client,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("could not connect to {endpoint}: {e}"),
            }
        };

        Self {
            client,
            shutdown,
            handle,
        }
    }

    async fn submit(&self, command: &str, nodes: &[&str], quorum: &str, timeout_ms: u64) -> String {
        self.client
            .clone()
            .submit_job(SubmitJobRequest {
                command: command.to_string(),
                node_names: nodes.iter().map(|n| n.to_string()).collect(),
                quorum: quorum.to_string(),
                timeout_ms,
            })
            .await
            .expect("submission accepted")
            .into_inner()
            .job_id
    }

    async fn status(&self, job_id: &str) -> proto::JobView {
        self.client
            .clone()
            .get_job_status(GetJobStatusRequest {
                job_id: job_id.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
    }

    async fn wait_for_job(&self, job_id: &str, status: proto::JobStatus) -> proto::JobView {
        assert_eventually(
            || async { self.status(job_id).await.status == status as i32 },
            Duration::from_secs(10),
            &format!("job should reach {status:?}"),
        )
        .await;
        self.status(job_id).await
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

fn run<'a>(view: &'a proto::JobView, node: &str) -> &'a proto::NodeRunView {
    view.runs.iter().find(|r| r.node_name == node).unwrap()
}

/// Test 1: A command runs on every node and each transcript comes back
#[tokio::test]
async fn test_command_runs_on_every_node() {
    let server = RunningServer::start(50161, &["web1", "web2"], StoreBackend::Memory).await;

    let job_id = server.submit("echo hello", &["web1", "web2"], "", 10_000).await;
    // The default quorum is every node, so both runs have succeeded.
    let view = server
        .wait_for_job(&job_id, proto::JobStatus::Complete)
        .await;
    for node in ["web1", "web2"] {
        let r = run(&view, node);
        assert_eq!(r.status, proto::RunStatus::Succeeded as i32);
        assert_eq!(r.output, "hello\n");
        assert_eq!(r.exit_status, Some(0));
        assert!(r.ack_time_ms.is_some());
        assert!(r.gaps.is_empty());
    }

    server.stop().await;
}

/// Test 2: Quorum is reached despite a node that is not connected
#[tokio::test]
async fn test_quorum_tolerates_missing_node() {
    let server = RunningServer::start(50162, &["web1", "web2"], StoreBackend::Memory).await;

    let job_id = server
        .submit("hostname", &["web1", "web2", "ghost"], "2", 10_000)
        .await;
    server
        .wait_for_job(&job_id, proto::JobStatus::Complete)
        .await;

    let view = server.status(&job_id).await;
    let ghost = run(&view, "ghost");
    assert_eq!(ghost.status, proto::RunStatus::Failed as i32);
    assert!(ghost.error.contains("not connected"));

    server.stop().await;
}

/// Test 3: Failing commands fail the job once quorum is out of reach
#[tokio::test]
async fn test_failing_command_fails_job() {
    let server = RunningServer::start(50163, &["web1", "web2"], StoreBackend::Memory).await;

    let job_id = server
        .submit("echo broken >&2; exit 4", &["web1", "web2"], "100%", 10_000)
        .await;
    let view = server.wait_for_job(&job_id, proto::JobStatus::Failed).await;

    let failed = view
        .runs
        .iter()
        .find(|r| r.status == proto::RunStatus::Failed as i32)
        .expect("at least one run failed");
    assert_eq!(failed.exit_status, Some(4));
    assert_eq!(failed.error_output, "broken\n");

    server.stop().await;
}

/// Test 4: Cancelling a job stops commands still running on the nodes
#[tokio::test]
async fn test_cancel_stops_running_command() {
    let server = RunningServer::start(50164, &["web1", "web2"], StoreBackend::Memory).await;

    let job_id = server
        .submit("sleep 30", &["web1", "web2"], "", 60_000)
        .await;
    assert_eventually(
        || async {
            server
                .status(&job_id)
                .await
                .runs
                .iter()
                .all(|r| r.status == proto::RunStatus::Running as i32)
        },
        Duration::from_secs(5),
        "both runs should start",
    )
    .await;

    let cancelled = server
        .client
        .clone()
        .cancel_job(CancelJobRequest {
            job_id: job_id.clone(),
            node_names: vec![],
        })
        .await
        .unwrap()
        .into_inner()
        .cancelled_nodes;
    assert_eq!(cancelled.len(), 2);

    let view = server.status(&job_id).await;
    assert_eq!(view.status, proto::JobStatus::Cancelled as i32);
    assert!(view
        .runs
        .iter()
        .all(|r| r.status == proto::RunStatus::Cancelled as i32));

    // Nothing the agents might still send can revive the job.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        server.status(&job_id).await.status,
        proto::JobStatus::Cancelled as i32
    );

    server.stop().await;
}

/// Test 5: Runs that outlive the job timeout are timed out
#[tokio::test]
async fn test_job_timeout_times_out_slow_runs() {
    let server = RunningServer::start(50165, &["web1"], StoreBackend::Memory).await;

    let job_id = server.submit("sleep 10", &["web1"], "1", 300).await;
    let view = server.wait_for_job(&job_id, proto::JobStatus::Failed).await;

    let r = run(&view, "web1");
    assert_eq!(r.status, proto::RunStatus::NackTimedOut as i32);
    assert!(r.ack_time_ms.is_some());

    server.stop().await;
}

/// Test 6: Output can be followed live until the run finishes
#[tokio::test]
async fn test_stream_output_follows_running_command() {
    let server = RunningServer::start(50166, &["web1"], StoreBackend::Memory).await;

    let job_id = server
        .submit("echo one; sleep 0.3; echo two", &["web1"], "1", 10_000)
        .await;

    let mut stream = server
        .client
        .clone()
        .stream_output(StreamOutputRequest {
            job_id: job_id.clone(),
            node_name: "web1".to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let mut stdout = Vec::new();
    let mut ended = false;
    let collected = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(frame) = stream.next().await {
            let frame = frame.unwrap();
            if frame.end {
                ended = true;
                break;
            }
            if frame.channel == proto::OutputChannel::Stdout as i32 {
                stdout.extend(frame.payload);
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "stream should end when the run finishes");
    assert!(ended);
    assert_eq!(String::from_utf8(stdout).unwrap(), "one\ntwo\n");

    server.stop().await;
}

async fn submit_and_finish(dir: &Path, port: u16) -> String {
    let server = RunningServer::start(
        port,
        &["web1"],
        StoreBackend::Sqlite(dir.join("dispatch.db")),
    )
    .await;
    let job_id = server.submit("echo persisted", &["web1"], "1", 10_000).await;
    server
        .wait_for_job(&job_id, proto::JobStatus::Complete)
        .await;
    server.stop().await;
    job_id
}

/// Test 7: Finished jobs survive a restart on the SQLite store
#[tokio::test]
async fn test_jobs_survive_restart_with_sqlite() {
    let dir = TempDir::new().unwrap();
    let job_id = submit_and_finish(dir.path(), 50167).await;

    let server = RunningServer::start(
        50168,
        &["web1"],
        StoreBackend::Sqlite(dir.path().join("dispatch.db")),
    )
    .await;
    let view = server.status(&job_id).await;
    assert_eq!(view.status, proto::JobStatus::Complete as i32);
    assert_eq!(view.command, "echo persisted");
    let r = run(&view, "web1");
    assert_eq!(r.status, proto::RunStatus::Succeeded as i32);
    assert_eq!(r.output, "persisted\n");

    server.stop().await;
}
