use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::output::OutputLimits;

/// Retry policy for storage writes.
///
/// Attempt `n` (starting at 0) waits `initial_backoff * 2^n`, capped at
/// `max_backoff`, plus up to half of that again as random jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Where jobs and node runs are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub retry: RetryConfig,
    pub output: OutputLimits,
    /// Used when a submission does not carry its own timeout.
    pub default_timeout: Duration,
    /// Number of shards inbound events are spread over. Events for one node
    /// run always land on the same shard.
    pub event_workers: usize,
    /// Capacity of each live transcript broadcast.
    pub transcript_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            output: OutputLimits::default(),
            default_timeout: Duration::from_secs(300),
            event_workers: 8,
            transcript_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub dashboard_addr: Option<SocketAddr>,
    pub store: StoreBackend,
    /// Node agents to run inside this process.
    pub local_nodes: Vec<String>,
    /// Bytes per output chunk sent by local node agents.
    pub agent_chunk_size: usize,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50061"
                .parse()
                .expect("default listen address is valid"),
            dashboard_addr: None,
            store: StoreBackend::default(),
            local_nodes: Vec::new(),
            agent_chunk_size: 4096,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_local_node(mut self, name: impl Into<String>) -> Self {
        self.local_nodes.push(name.into());
        self
    }

    pub fn with_store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }
}
