//! gRPC server implementation.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tonic::transport::server::TcpIncoming;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::quotagate::v1::quota_service_server::QuotaServiceServer;
use super::service::QuotaServiceImpl;
use crate::error::{QuotaError, Result};
use crate::store::QuotaStore;

/// gRPC server for the quota service.
pub struct GrpcServer<S: QuotaStore + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The service handling requests
    service: QuotaServiceImpl<S>,
}

impl<S: QuotaStore + 'static> GrpcServer<S> {
    pub fn new(addr: SocketAddr, service: QuotaServiceImpl<S>) -> Self {
        Self { addr, service }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the gRPC server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_with_listener(listener, signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| QuotaError::Io(std::io::Error::other(e)))?;

        info!(
            addr = %local_addr,
            "Starting gRPC server for QuotaService with graceful shutdown"
        );

        Server::builder()
            .add_service(QuotaServiceServer::new(self.service))
            .serve_with_incoming_shutdown(incoming, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                QuotaError::Grpc(e)
            })
    }
}
