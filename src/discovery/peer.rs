use crate::zfx_id::Id;

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub region: Option<String>,
    pub services: BTreeSet<String>,
}

/// A remote node as known to discovery.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: Id,
    pub address: SocketAddr,
    /// Capacity declared by the peer itself, in arbitrary units.
    pub capacity: u64,
    /// Last measured round trip, if any.
    pub latency: Option<Duration>,
    /// Fraction of successful interactions in `[0, 1]`.
    pub reliability: f64,
    pub capabilities: Capabilities,
}

impl PeerInfo {
    pub fn new(id: Id, address: SocketAddr) -> Self {
        PeerInfo {
            id,
            address,
            capacity: 0,
            latency: None,
            reliability: Reliability::default().score(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn offers(&self, service: &str) -> bool {
        self.capabilities.services.contains(service)
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}@{} cap={} lat={:?} rel={:.2}",
            self.id, self.address, self.capacity, self.latency, self.reliability
        )
    }
}

/// Restricts which peers a lookup returns. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityFilter {
    pub region: Option<String>,
    pub service: Option<String>,
    pub min_capacity: u64,
}

impl CapabilityFilter {
    pub fn any() -> Self {
        CapabilityFilter::default()
    }

    pub fn service(name: &str) -> Self {
        CapabilityFilter { service: Some(name.to_string()), ..CapabilityFilter::default() }
    }

    pub fn matches(&self, peer: &PeerInfo) -> bool {
        if let Some(region) = &self.region {
            if peer.capabilities.region.as_ref() != Some(region) {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if !peer.offers(service) {
                return false;
            }
        }
        peer.capacity >= self.min_capacity
    }

    /// The key a lookup for this filter converges on: the hash of the service name, or
    /// `local` when no service is requested.
    pub fn target(&self, local: Id) -> Id {
        match &self.service {
            Some(service) => Id::new(service.as_bytes()),
            None => local,
        }
    }
}

/// Success and failure counts of interactions with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reliability {
    pub successes: u32,
    pub failures: u32,
}

impl Reliability {
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes = self.successes.saturating_add(1);
        } else {
            self.failures = self.failures.saturating_add(1);
        }
    }

    /// Laplace smoothed success ratio: an unknown peer scores 0.5.
    pub fn score(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }
}
