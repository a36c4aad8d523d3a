use super::peer::PeerInfo;

use std::cmp::Ordering;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RankingWeights {
    pub latency: f64,
    pub capacity: f64,
    pub reliability: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        RankingWeights { latency: 0.4, capacity: 0.3, reliability: 0.3 }
    }
}

/// Orders candidate peers: lower latency, higher capacity (up to a saturation point) and
/// higher reliability are better.
#[derive(Debug, Clone)]
pub struct Ranking {
    pub weights: RankingWeights,
    /// Latency at which the latency component drops to one half.
    pub reference_latency: Duration,
    /// Capacity beyond which more capacity does not improve the score.
    pub capacity_saturation: u64,
}

impl Ranking {
    pub fn score(&self, peer: &PeerInfo) -> f64 {
        let reference = self.reference_latency.as_secs_f64().max(f64::EPSILON);
        // Unmeasured peers are assumed to sit at the reference latency.
        let latency = peer.latency.map(|l| l.as_secs_f64()).unwrap_or(reference);
        let latency = 1.0 / (1.0 + latency / reference);
        let saturation = self.capacity_saturation.max(1);
        let capacity = peer.capacity.min(saturation) as f64 / saturation as f64;
        let reliability = peer.reliability.max(0.0).min(1.0);
        self.weights.latency * latency + self.weights.capacity * capacity + self.weights.reliability * reliability
    }

    /// Sorts best first; equal scores are ordered by id.
    pub fn rank(&self, peers: Vec<PeerInfo>) -> Vec<PeerInfo> {
        let mut scored: Vec<(f64, PeerInfo)> = peers.into_iter().map(|p| (self.score(&p), p)).collect();
        scored.sort_by(|(a_score, a), (b_score, b)| match b_score.partial_cmp(a_score) {
            Some(Ordering::Equal) | None => a.id.cmp(&b.id),
            Some(ordering) => ordering,
        });
        scored.into_iter().map(|(_, p)| p).collect()
    }
}
