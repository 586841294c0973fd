//! go-plugin plumbing: health checking and the controller service Terraform
//! uses to stop the provider.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::Notify;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::health::health_check_response::ServingStatus;
use crate::health::health_server::Health;
use crate::health::{HealthCheckRequest, HealthCheckResponse};
use crate::plugin_proto::grpc_controller_server::GrpcController;
use crate::plugin_proto::Empty;

/// Magic cookie go-plugin uses to tell a plugin launch from a user running the binary
pub const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

/// go-plugin core protocol version
pub const CORE_PROTOCOL_VERSION: u32 = 1;
/// Terraform plugin protocol version
pub const APP_PROTOCOL_VERSION: u32 = 6;

/// Handshake line printed on stdout once the server is listening
pub fn handshake_line(addr: &std::net::SocketAddr, cert: Option<&str>) -> String {
    format!(
        "{}|{}|tcp|{}|grpc|{}",
        CORE_PROTOCOL_VERSION,
        APP_PROTOCOL_VERSION,
        addr,
        cert.unwrap_or_default()
    )
}

/// Reports the plugin as serving
pub struct HealthService;

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    type WatchStream =
        Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let response = HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        };
        Ok(Response::new(Box::pin(futures::stream::once(async move {
            Ok(response)
        }))))
    }
}

/// Signals the server loop to stop when Terraform is done with the plugin
pub struct ControllerService {
    shutdown: Arc<Notify>,
}

impl ControllerService {
    pub fn new(shutdown: Arc<Notify>) -> Self {
        Self { shutdown }
    }
}

#[tonic::async_trait]
impl GrpcController for ControllerService {
    async fn shutdown(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        info!("Shutdown requested by Terraform");
        self.shutdown.notify_one();
        Ok(Response::new(Empty {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_line() {
        let addr: std::net::SocketAddr = "127.0.0.1:41234".parse().unwrap();
        assert_eq!(
            handshake_line(&addr, Some("MIIB")),
            "1|6|tcp|127.0.0.1:41234|grpc|MIIB"
        );
        assert_eq!(handshake_line(&addr, None), "1|6|tcp|127.0.0.1:41234|grpc|");
    }

    #[tokio::test]
    async fn test_health_serving() {
        let response = HealthService
            .check(Request::new(HealthCheckRequest {
                service: "plugin".into(),
            }))
            .await
            .unwrap();
        assert_eq!(response.get_ref().status, ServingStatus::Serving as i32);
    }

    #[tokio::test]
    async fn test_shutdown_notifies() {
        let notify = Arc::new(Notify::new());
        let controller = ControllerService::new(notify.clone());
        controller.shutdown(Request::new(Empty {})).await.unwrap();
        // notify_one stores a permit, so this completes immediately
        notify.notified().await;
    }
}
