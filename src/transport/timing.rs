//! RTT estimation and timing utilities.
//!
//! Two estimators live here. [`RttEstimator`] follows RFC 6298 and tracks the
//! ping round trip of a single connection. [`TtlEstimator`] is the session-wide
//! latency estimate of the center, fed by TTL stamps, which drives every
//! adaptive timeout above the connection layer.

use std::time::Duration;

use rand::Rng;

use crate::core::{INITIAL_TTL, MIN_TTL, RESEND_TIMEOUT_FLOOR};

/// Timing constants of the connection RTT estimator.
pub mod constants {
    use std::time::Duration;

    /// RTO used until the first ping completes.
    pub const INITIAL_RTO: Duration = Duration::from_secs(1);

    /// Lower clamp of the RTO.
    pub const MIN_RTO: Duration = Duration::from_millis(100);

    /// Upper clamp of the RTO.
    pub const MAX_RTO: Duration = Duration::from_secs(60);

    /// Clock granularity `G` of RFC 6298.
    pub const CLOCK_GRANULARITY: Duration = Duration::from_millis(100);

    /// Multiplier applied under the square root of the resend timeout.
    pub const RESEND_TIMEOUT_FACTOR: f64 = 20.0;
}

/// Ping round-trip estimate of one connection (RFC 6298, gains 1/8 and 1/4).
///
/// The RTO scales the idle and ping timeouts of that connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    /// `(srtt, rttvar)` once a sample arrived.
    smoothed: Option<(Duration, Duration)>,
}

impl RttEstimator {
    /// Create an estimator without samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one ping round trip into the estimate.
    pub fn update(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => (sample, sample / 2),
            Some((srtt, rttvar)) => {
                let deviation = srtt.abs_diff(sample);
                (
                    srtt - srtt / 8 + sample / 8,
                    rttvar - rttvar / 4 + deviation / 4,
                )
            }
        });
    }

    /// Smoothed round trip, if sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.smoothed.map(|(srtt, _)| srtt)
    }

    /// `srtt + max(G, 4 * rttvar)`, clamped.
    pub fn rto(&self) -> Duration {
        match self.smoothed {
            None => constants::INITIAL_RTO,
            Some((srtt, rttvar)) => (srtt + (rttvar * 4).max(constants::CLOCK_GRANULARITY))
                .clamp(constants::MIN_RTO, constants::MAX_RTO),
        }
    }

    /// Check if at least one sample arrived.
    pub fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }
}

/// Session latency estimate fed by TTL stamps.
///
/// Updated as `ttl = (ttl + sample) / 2` with a 50 ms floor.
#[derive(Debug, Clone, Copy)]
pub struct TtlEstimator {
    ttl: Duration,
    samples: u64,
}

impl Default for TtlEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlEstimator {
    /// Create an estimator starting at the initial TTL.
    pub fn new() -> Self {
        Self {
            ttl: INITIAL_TTL,
            samples: 0,
        }
    }

    /// Fold one round-trip sample into the estimate.
    pub fn update(&mut self, sample: Duration) {
        self.ttl = ((self.ttl + sample) / 2).max(MIN_TTL);
        self.samples += 1;
    }

    /// Current estimate.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of samples folded in so far.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Retransmission timeout: `max(floor, sqrt(ttl_ms * 20))` milliseconds.
    ///
    /// Grows sub-linearly so high-latency paths do not stall for minutes.
    pub fn resend_timeout(&self, floor: Duration) -> Duration {
        let ttl_ms = self.ttl.as_secs_f64() * 1000.0;
        let scaled = Duration::from_secs_f64(
            (ttl_ms * constants::RESEND_TIMEOUT_FACTOR).sqrt() / 1000.0,
        );
        scaled.max(floor)
    }

    /// Retransmission timeout with the default floor.
    pub fn default_resend_timeout(&self) -> Duration {
        self.resend_timeout(RESEND_TIMEOUT_FLOOR)
    }
}

/// Randomize `base` to somewhere in `[base * lo, base * hi]`.
pub fn jitter(base: Duration, lo: f64, hi: f64) -> Duration {
    let factor = rand::thread_rng().gen_range(lo..=hi);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rto_before_first_ping() {
        let rtt = RttEstimator::new();
        assert!(!rtt.has_sample());
        assert_eq!(rtt.srtt(), None);
        assert_eq!(rtt.rto(), constants::INITIAL_RTO);
    }

    #[test]
    fn test_first_ping_sets_srtt_and_half_variance() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(200));
        assert_eq!(rtt.srtt(), Some(Duration::from_millis(200)));
        // 200 + 4 * 100
        assert_eq!(rtt.rto(), Duration::from_millis(600));
    }

    #[test]
    fn test_later_pings_move_srtt_by_an_eighth() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(80));
        rtt.update(Duration::from_millis(160));
        assert_eq!(rtt.srtt(), Some(Duration::from_millis(90)));
    }

    #[test]
    fn test_rto_is_clamped() {
        let mut fast = RttEstimator::new();
        for _ in 0..50 {
            fast.update(Duration::from_micros(50));
        }
        assert!(fast.rto() >= constants::MIN_RTO);
        assert!(fast.rto() < Duration::from_millis(101));

        let mut slow = RttEstimator::new();
        slow.update(Duration::from_secs(90));
        assert_eq!(slow.rto(), constants::MAX_RTO);
    }

    #[test]
    fn test_ttl_estimator_halves_toward_sample() {
        let mut ttl = TtlEstimator::new();
        ttl.update(Duration::from_millis(100));
        assert_eq!(ttl.ttl(), Duration::from_millis(200));
        ttl.update(Duration::from_millis(100));
        assert_eq!(ttl.ttl(), Duration::from_millis(150));
        assert_eq!(ttl.samples(), 2);
    }

    #[test]
    fn test_ttl_estimator_floor() {
        let mut ttl = TtlEstimator::new();
        for _ in 0..20 {
            ttl.update(Duration::from_millis(1));
        }
        assert_eq!(ttl.ttl(), MIN_TTL);
    }

    #[test]
    fn test_resend_timeout_scaling() {
        let mut ttl = TtlEstimator::new();
        // sqrt(300 * 20) = 77ms, below the floor
        assert_eq!(ttl.default_resend_timeout(), RESEND_TIMEOUT_FLOOR);

        // Drive the estimate to ~80s: sqrt(80000 * 20) = 1264ms
        for _ in 0..40 {
            ttl.update(Duration::from_secs(80));
        }
        let rto = ttl.default_resend_timeout();
        assert!(rto > RESEND_TIMEOUT_FLOOR);
        assert!(rto < Duration::from_millis(1300));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let value = jitter(base, 0.5, 1.5);
            assert!(value >= Duration::from_secs(5));
            assert!(value <= Duration::from_secs(15));
        }
    }
}
