pub mod dispatch_service;
pub mod server;

pub use dispatch_service::DispatchGrpcService;
pub use server::GrpcServer;
