use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::NodeAgent;
use crate::config::ServerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::dispatch::{CoordinatorDriver, DispatchCoordinator};
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::messaging::{InboundEvent, LocalBus};
use crate::store;

const INBOUND_CAPACITY: usize = 4096;

/// A dispatcher process: store, message bus, coordinator, local node agents
/// and the operator surfaces.
pub struct DispatchServer {
    config: ServerConfig,
    coordinator: Arc<DispatchCoordinator>,
    bus: Arc<LocalBus>,
    driver: CoordinatorDriver,
    inbound: mpsc::Receiver<InboundEvent>,
}

impl DispatchServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = store::open(&config.store)?;
        let (bus, inbound) = LocalBus::new(INBOUND_CAPACITY);
        let (coordinator, driver) =
            DispatchCoordinator::new(config.coordinator.clone(), store, bus.clone());

        Ok(Self {
            config,
            coordinator,
            bus,
            driver,
            inbound,
        })
    }

    pub fn coordinator(&self) -> Arc<DispatchCoordinator> {
        self.coordinator.clone()
    }

    pub fn bus(&self) -> Arc<LocalBus> {
        self.bus.clone()
    }

    /// Run every subsystem until `shutdown` is cancelled.
    ///
    /// 1. Reloads persisted jobs and re-arms their deadlines
    /// 2. Connects and spawns the in-process node agents
    /// 3. Spawns the coordinator's event loop
    /// 4. Optionally spawns the HTTP dashboard
    /// 5. Runs the gRPC server (blocking)
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let recovered = self.coordinator.recover().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered persisted jobs");
        }

        for node_name in &self.config.local_nodes {
            let link = self.bus.connect(node_name).await;
            let agent = NodeAgent::new(link, self.config.agent_chunk_size);
            tokio::spawn(agent.run(shutdown.clone()));
        }

        tokio::spawn(
            self.coordinator
                .clone()
                .run(self.driver, self.inbound, shutdown.clone()),
        );

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                coordinator: self.coordinator.clone(),
            };
            tokio::spawn(run_dashboard(dashboard_addr, dashboard_state, shutdown.clone()));
        }

        let server = GrpcServer::new(self.config.listen_addr, self.coordinator.clone());
        server.run(shutdown).await?;
        tracing::info!("Dispatcher stopped");
        Ok(())
    }
}
