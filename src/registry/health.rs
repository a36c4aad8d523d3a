use super::service::ServiceInfo;

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Probes a local service. A check that does not finish within the configured timeout
/// counts as a failure.
pub trait HealthCheck: Send + Sync {
    fn check(&self, service: &ServiceInfo) -> BoxFuture<'static, bool>;
}

/// Publishes a service entry to the rest of the network.
pub trait Announcer: Send + Sync {
    fn announce(&self, service: ServiceInfo) -> BoxFuture<'static, ()>;
}

/// Healthy when any endpoint accepts a TCP connection.
pub struct TcpHealthCheck;

impl HealthCheck for TcpHealthCheck {
    fn check(&self, service: &ServiceInfo) -> BoxFuture<'static, bool> {
        let endpoints = service.endpoints.clone();
        let name = service.name.clone();
        async move {
            for endpoint in endpoints {
                match TcpStream::connect(endpoint).await {
                    Ok(_) => return true,
                    Err(err) => debug!("{} at {} unreachable: {}", name, endpoint, err),
                }
            }
            false
        }
        .boxed()
    }
}
