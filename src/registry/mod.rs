//! Service Registry: services offered by this node and those announced by others.
//!
//! Local services are health checked and periodically re-announced. A service that fails
//! `unhealthy_threshold` checks in a row is announced once as unhealthy and then goes quiet
//! until a check succeeds again. Remote services that are not refreshed within the TTL
//! are forgotten.
mod health;
mod service;
mod service_registry;

pub use health::{Announcer, HealthCheck, TcpHealthCheck};
pub use service::{HealthStatus, ServiceInfo};
pub use service_registry::*;

use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub check_interval_ms: u64,
    pub check_timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub announce_interval_ms: u64,
    pub ttl_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        RegistrySettings {
            check_interval_ms: 30_000,
            check_timeout_ms: 5_000,
            unhealthy_threshold: 3,
            announce_interval_ms: 10_000,
            ttl_ms: 60_000,
        }
    }
}

impl RegistrySettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// How often remote entries are checked against the TTL.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_ms / 4).max(1))
    }
}
