//! Selection score of a peer.
//!
//! Scores fall into bands by connectivity so a better-connected peer always
//! outranks a worse one. Inside a band the score is `r = random^(1 + pending)`,
//! which drifts toward zero as a peer accumulates in-flight calls.

/// Connectivity of a peer, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eligibility {
    /// No connection at all.
    Unconnected,
    /// Only inbound connections; an outbound one should be opened.
    NeedsOutbound,
    /// Outbound connection still waiting for the init response.
    Identifying,
    /// Identified outbound connection.
    Ready,
}

impl Eligibility {
    /// Lower bound and width of the band.
    pub fn band(&self) -> (f64, f64) {
        match self {
            Eligibility::Unconnected => (0.1, 0.1),
            Eligibility::NeedsOutbound => (0.2, 0.1),
            Eligibility::Identifying => (0.3, 0.1),
            Eligibility::Ready => (0.4, 0.6),
        }
    }

    pub fn score(&self, r: f64) -> f64 {
        let (base, width) = self.band();
        base + r * width
    }
}

/// Uniform draw biased toward zero by outstanding work.
pub fn weighted_random(random: f64, pending: usize) -> f64 {
    random.powf(1.0 + pending as f64)
}
