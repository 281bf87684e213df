use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tokio_util::sync::CancellationToken;

use crate::dispatch::DispatchCoordinator;
use crate::grpc::dispatch_service::DispatchGrpcService;
use crate::proto::dispatch_service_server::DispatchServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    coordinator: Arc<DispatchCoordinator>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, coordinator: Arc<DispatchCoordinator>) -> Self {
        Self { addr, coordinator }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = DispatchGrpcService::new(self.coordinator);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(DispatchServiceServer::new(service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
