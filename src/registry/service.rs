use crate::colored::Colorize;
use crate::zfx_id::Id;
use crate::{Error, Result};

use tai64::Tai64N;

use std::fmt;
use std::net::SocketAddr;

const MAX_NAME_LEN: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Debug for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "{}", "healthy".green()),
            HealthStatus::Unhealthy => write!(f, "{}", "unhealthy".red()),
        }
    }
}

/// A capability offered by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub endpoints: Vec<SocketAddr>,
    pub status: HealthStatus,
    /// The node offering the service.
    pub owner: Id,
    /// When the owner last vouched for this entry.
    pub updated: Tai64N,
}

impl ServiceInfo {
    pub fn new(name: &str, version: &str, endpoints: Vec<SocketAddr>) -> Self {
        ServiceInfo {
            name: name.to_string(),
            version: version.to_string(),
            endpoints,
            status: HealthStatus::Healthy,
            owner: Id::zero(),
            updated: Tai64N::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidService("empty name"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidService("name too long"));
        }
        if !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
            return Err(Error::InvalidService("invalid name"));
        }
        if self.version.is_empty() {
            return Err(Error::InvalidService("empty version"));
        }
        if self.endpoints.is_empty() {
            return Err(Error::InvalidService("no endpoints"));
        }
        Ok(())
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn touch(&mut self) {
        self.updated = Tai64N::now();
    }
}
