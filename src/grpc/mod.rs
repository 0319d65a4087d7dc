//! gRPC surface of the quota service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::QuotaServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod quotagate {
        pub mod v1 {
            tonic::include_proto!("quotagate.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::quotagate::v1::{
    quota_service_client::QuotaServiceClient, quota_service_server::QuotaServiceServer,
    CheckAndConsumeRequest, CheckAndConsumeResponse, CleanupExpiredRequest,
    CleanupExpiredResponse, ResetRateLimitRequest, ResetRateLimitResponse,
};
