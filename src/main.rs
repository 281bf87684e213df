use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::config::{CoordinatorConfig, ServerConfig, StoreBackend};
use fleet_dispatch::proto::dispatch_service_client::DispatchServiceClient;
use fleet_dispatch::proto::{
    CancelJobRequest, GetJobStatusRequest, JobStatus, JobView, ListJobsRequest, OutputChannel,
    RunStatus, StreamOutputRequest, SubmitJobRequest,
};
use fleet_dispatch::server::DispatchServer;
use fleet_dispatch::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-dispatch")]
#[command(version)]
#[command(about = "Fan shell commands out to a fleet of nodes and track them to a quorum")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a dispatcher
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "50061")]
    port: u16,

    /// Port for the HTTP API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Storage backend for jobs and node runs
    #[arg(long, default_value = "memory")]
    store: StoreKind,

    /// Database file for the sqlite backend
    #[arg(long, default_value = "fleet-dispatch.db")]
    db_path: PathBuf,

    /// Node agents to run in this process (comma-separated)
    #[arg(long, value_delimiter = ',')]
    local_nodes: Vec<String>,

    /// Timeout for jobs submitted without one, in seconds
    #[arg(long, default_value = "300")]
    default_timeout_secs: u64,

    /// Number of event shards
    #[arg(long, default_value = "8")]
    event_workers: usize,
}

#[derive(Debug, Clone, ValueEnum)]
enum StoreKind {
    Memory,
    Sqlite,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Dispatcher address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50061")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Run a command on a set of nodes
    Submit {
        /// The command to execute (e.g., "uptime")
        command: String,

        /// Target nodes (comma-separated)
        #[arg(long, short = 'n', value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Nodes that must succeed: a count ("3") or a share ("75%").
        /// Defaults to all of them.
        #[arg(long, short = 'q', default_value = "")]
        quorum: String,

        /// Job timeout in milliseconds (0 uses the server default)
        #[arg(long, default_value = "0")]
        timeout_ms: u64,
    },
    /// Get status of a job and its node runs
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a job, or only some of its nodes
    Cancel {
        /// The job ID (UUID)
        job_id: String,

        /// Only cancel these nodes (comma-separated)
        #[arg(long, short = 'n', value_delimiter = ',')]
        nodes: Vec<String>,
    },
    /// List all jobs
    List,
    /// Print a node's output, following it until the run ends
    Output {
        /// The job ID (UUID)
        job_id: String,

        /// The node whose output to print
        node: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    created_at_ms: i64,
    quorum: u32,
}

#[derive(Serialize)]
struct RunOutput {
    node_name: String,
    status: String,
    ack_time_ms: Option<i64>,
    end_time_ms: Option<i64>,
    exit_status: Option<i32>,
    output: String,
    error_output: String,
    error: String,
    gaps: usize,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    command: String,
    status: String,
    quorum_spec: String,
    quorum: u32,
    timeout_ms: u64,
    created_at_ms: i64,
    updated_at_ms: i64,
    persistence_degraded: bool,
    runs: Vec<RunOutput>,
}

#[derive(Serialize)]
struct CancelOutput {
    job_id: String,
    cancelled_nodes: Vec<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn job_status_to_string(status: i32) -> String {
    match JobStatus::try_from(status) {
        Ok(JobStatus::Submitted) => "SUBMITTED".to_string(),
        Ok(JobStatus::Running) => "RUNNING".to_string(),
        Ok(JobStatus::Complete) => "COMPLETE".to_string(),
        Ok(JobStatus::Failed) => "FAILED".to_string(),
        Ok(JobStatus::Cancelled) => "CANCELLED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn run_status_to_string(status: i32) -> String {
    match RunStatus::try_from(status) {
        Ok(RunStatus::Invited) => "INVITED".to_string(),
        Ok(RunStatus::Acked) => "ACKED".to_string(),
        Ok(RunStatus::Running) => "RUNNING".to_string(),
        Ok(RunStatus::Succeeded) => "SUCCEEDED".to_string(),
        Ok(RunStatus::Failed) => "FAILED".to_string(),
        Ok(RunStatus::NackTimedOut) => "NACK_TIMED_OUT".to_string(),
        Ok(RunStatus::Cancelled) => "CANCELLED".to_string(),
        _ => "UNKNOWN".to_string(),
    }
}

fn job_status_output(view: JobView) -> JobStatusOutput {
    JobStatusOutput {
        job_id: view.job_id,
        command: view.command,
        status: job_status_to_string(view.status),
        quorum_spec: view.quorum_spec,
        quorum: view.quorum,
        timeout_ms: view.timeout_ms,
        created_at_ms: view.created_at_ms,
        updated_at_ms: view.updated_at_ms,
        persistence_degraded: view.persistence_degraded,
        runs: view
            .runs
            .into_iter()
            .map(|run| RunOutput {
                node_name: run.node_name,
                status: run_status_to_string(run.status),
                ack_time_ms: run.ack_time_ms,
                end_time_ms: run.end_time_ms,
                exit_status: run.exit_status,
                output: run.output,
                error_output: run.error_output,
                error: run.error,
                gaps: run.gaps.len(),
            })
            .collect(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let store = match args.store {
        StoreKind::Memory => StoreBackend::Memory,
        StoreKind::Sqlite => StoreBackend::Sqlite(args.db_path),
    };

    let mut config = ServerConfig::new(listen_addr).with_store(store);
    if let Some(p) = args.dashboard_port {
        config = config.with_dashboard(format!("0.0.0.0:{}", p).parse()?);
    }
    for node in args.local_nodes.into_iter().filter(|n| !n.trim().is_empty()) {
        config = config.with_local_node(node);
    }
    config.coordinator = CoordinatorConfig {
        default_timeout: Duration::from_secs(args.default_timeout_secs),
        event_workers: args.event_workers,
        ..CoordinatorConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        store = ?config.store,
        local_nodes = ?config.local_nodes,
        "Starting fleet dispatcher"
    );

    let shutdown = install_shutdown_handler()?;
    let server = DispatchServer::new(config)?;
    server.run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut DispatchServiceClient<Channel>,
    request: SubmitJobRequest,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = match client.submit_job(request).await {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Job submission failed: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: resp.job_id,
                created_at_ms: resp.created_at_ms,
                quorum: resp.quorum,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", resp.job_id);
            println!("Quorum: {}", resp.quorum);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut DispatchServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let view = client
        .get_job_status(GetJobStatusRequest { job_id })
        .await?
        .into_inner();
    let output = job_status_output(view);

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:   {}", output.job_id);
            println!("Command:  {}", output.command);
            println!("Status:   {}", output.status);
            println!(
                "Quorum:   {} of {} ({})",
                output.quorum,
                output.runs.len(),
                output.quorum_spec
            );
            if output.persistence_degraded {
                println!("Warning:  some changes were not persisted");
            }
            println!();
            println!("{:<20} {:<16} {:<6} ERROR", "NODE", "STATUS", "EXIT");
            println!("{}", "-".repeat(70));
            for run in &output.runs {
                let exit = run
                    .exit_status
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<16} {:<6} {}",
                    truncate(&run.node_name, 20),
                    run.status,
                    exit,
                    run.error
                );
            }
            for run in &output.runs {
                if run.output.is_empty() && run.error_output.is_empty() {
                    continue;
                }
                println!();
                println!("[{}]", run.node_name);
                for line in run.output.lines() {
                    println!("  {}", line);
                }
                for line in run.error_output.lines() {
                    println!("  ! {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    client: &mut DispatchServiceClient<Channel>,
    job_id: String,
    node_names: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resp = client
        .cancel_job(CancelJobRequest {
            job_id: job_id.clone(),
            node_names,
        })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = CancelOutput {
                job_id,
                cancelled_nodes: resp.cancelled_nodes,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if resp.cancelled_nodes.is_empty() {
                println!("No runs were still in flight.");
            } else {
                println!("Cancelled: {}", resp.cancelled_nodes.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &mut DispatchServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.list_jobs(ListJobsRequest {}).await?.into_inner();
    let jobs: Vec<JobStatusOutput> = response.jobs.into_iter().map(job_status_output).collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<38} {:<10} {:<8} COMMAND", "JOB ID", "STATUS", "NODES");
                println!("{}", "-".repeat(78));

                for job in &jobs {
                    let succeeded = job
                        .runs
                        .iter()
                        .filter(|r| r.status == "SUCCEEDED")
                        .count();
                    println!(
                        "{:<38} {:<10} {:<8} {}",
                        job.job_id,
                        job.status,
                        format!("{}/{}", succeeded, job.runs.len()),
                        truncate(&job.command, 20)
                    );
                }
                println!();
                println!("{} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_job_output(
    client: &mut DispatchServiceClient<Channel>,
    job_id: String,
    node_name: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut frames = client
        .stream_output(StreamOutputRequest { job_id, node_name })
        .await?
        .into_inner();

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if frame.end {
            break;
        }
        match OutputChannel::try_from(frame.channel) {
            Ok(OutputChannel::Stderr) => stderr.write_all(&frame.payload)?,
            _ => stdout.write_all(&frame.payload)?,
        }
        stdout.flush()?;
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let channel = Channel::from_shared(client.addr.clone())?
                .connect()
                .await?;
            let mut grpc_client = DispatchServiceClient::new(channel);

            match command {
                JobCommands::Submit {
                    command,
                    nodes,
                    quorum,
                    timeout_ms,
                } => {
                    let request = SubmitJobRequest {
                        command,
                        node_names: nodes,
                        quorum,
                        timeout_ms,
                    };
                    handle_job_submit(&mut grpc_client, request, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
                JobCommands::Cancel { job_id, nodes } => {
                    handle_job_cancel(&mut grpc_client, job_id, nodes, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&mut grpc_client, &client.output).await?;
                }
                JobCommands::Output { job_id, node } => {
                    handle_job_output(&mut grpc_client, job_id, node).await?;
                }
            }
        }
    }

    Ok(())
}
