pub mod agent;
pub mod config;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod messaging;
pub mod server;
pub mod shutdown;
pub mod store;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("dispatch");
}
