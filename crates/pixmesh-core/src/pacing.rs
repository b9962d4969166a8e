//! Adaptive inter-chunk pacing.
//!
//! Airtime on a LoRa mesh is scarce; the sender sleeps between chunks and
//! lets the observed link-ack success rate steer that sleep inside a fixed
//! band. A struggling link slows transmission down 20% per observation; a
//! clean link speeds it up 5% at a time.

use std::time::Duration;

/// Lower bound on the inter-chunk delay.
pub const MIN_CHUNK_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the inter-chunk delay.
pub const MAX_CHUNK_DELAY: Duration = Duration::from_secs(10);

/// Baseline inter-chunk delay.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_secs(4);

/// Transfer-completion wait floor.
pub const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Transfer-completion wait ceiling.
pub const MAX_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

// Observations required before the controller trusts the success rate.
const MIN_SAMPLES: u32 = 5;

const BACKOFF_FACTOR: f64 = 1.20;
const SPEEDUP_FACTOR: f64 = 0.95;
const LOW_WATER: f64 = 0.90;
const HIGH_WATER: f64 = 0.98;

/// Tracks per-chunk outcomes and derives the current inter-chunk delay.
#[derive(Debug, Clone)]
pub struct AdaptivePacer {
    delay_secs: f64,
    adaptive: bool,
    successes: u32,
    failures: u32,
}

impl AdaptivePacer {
    /// Create a pacer starting from the given baseline delay, clamped to
    /// the permitted band.
    #[must_use]
    pub fn new(initial: Duration, adaptive: bool) -> Self {
        let delay_secs = initial
            .as_secs_f64()
            .clamp(MIN_CHUNK_DELAY.as_secs_f64(), MAX_CHUNK_DELAY.as_secs_f64());
        Self {
            delay_secs,
            adaptive,
            successes: 0,
            failures: 0,
        }
    }

    /// Fast mode: delay pinned to the minimum, adaptation off.
    #[must_use]
    pub fn fast() -> Self {
        Self::new(MIN_CHUNK_DELAY, false)
    }

    /// Record the outcome of one completed chunk and adapt the delay.
    pub fn record(&mut self, success: bool) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if self.adaptive {
            self.observe();
        }
    }

    fn observe(&mut self) {
        let Some(rate) = self.success_rate() else {
            return;
        };

        if rate < LOW_WATER {
            self.delay_secs = (self.delay_secs * BACKOFF_FACTOR).min(MAX_CHUNK_DELAY.as_secs_f64());
            tracing::debug!(rate, delay = self.delay_secs, "pacing backed off");
        } else if rate > HIGH_WATER {
            self.delay_secs = (self.delay_secs * SPEEDUP_FACTOR).max(MIN_CHUNK_DELAY.as_secs_f64());
            tracing::debug!(rate, delay = self.delay_secs, "pacing sped up");
        }
    }

    /// Current inter-chunk delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs)
    }

    /// Success rate over all recorded chunks, once enough samples exist.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        if total < MIN_SAMPLES {
            return None;
        }
        Some(f64::from(self.successes) / f64::from(total))
    }

    /// Chunks that got a link-layer acknowledgement.
    #[must_use]
    pub const fn successes(&self) -> u32 {
        self.successes
    }

    /// Chunks that exhausted their retries.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

/// Wall-clock budget for the completion wait after the last chunk.
///
/// Scales with the expected duration of a full pass and is clamped to
/// `[60 s, 300 s]`.
#[must_use]
pub fn transfer_timeout(total_chunks: u8, delay: Duration) -> Duration {
    let expected = delay.as_secs_f64() * f64::from(total_chunks);
    Duration::from_secs_f64((expected * 1.5).clamp(
        MIN_TRANSFER_TIMEOUT.as_secs_f64(),
        MAX_TRANSFER_TIMEOUT.as_secs_f64(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_delay_is_clamped() {
        assert_eq!(
            AdaptivePacer::new(Duration::from_secs(30), true).delay(),
            MAX_CHUNK_DELAY
        );
        assert_eq!(
            AdaptivePacer::new(Duration::from_millis(100), true).delay(),
            MIN_CHUNK_DELAY
        );
    }

    #[test]
    fn test_no_adaptation_below_sample_floor() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        for _ in 0..4 {
            pacer.record(false);
        }
        assert_eq!(pacer.delay(), DEFAULT_CHUNK_DELAY);
        assert!(pacer.success_rate().is_none());
    }

    #[test]
    fn test_low_success_rate_backs_off() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        // 17 of 20 acked is an 85% rate
        for i in 0..20 {
            pacer.record(i % 7 != 0);
        }
        assert!(pacer.delay() >= Duration::from_secs_f64(4.8));
    }

    #[test]
    fn test_high_success_rate_speeds_up() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        for _ in 0..20 {
            pacer.record(true);
        }
        assert!(pacer.delay() < DEFAULT_CHUNK_DELAY);

        // Each further step strictly decreases the delay until the floor
        let mut previous = pacer.delay();
        for _ in 0..20 {
            pacer.record(true);
            let current = pacer.delay();
            if previous > MIN_CHUNK_DELAY {
                assert!(current < previous);
            } else {
                assert_eq!(current, MIN_CHUNK_DELAY);
            }
            previous = current;
        }
    }

    #[test]
    fn test_delay_stays_in_band() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        for _ in 0..500 {
            pacer.record(false);
            assert!(pacer.delay() >= MIN_CHUNK_DELAY);
            assert!(pacer.delay() <= MAX_CHUNK_DELAY);
        }
        assert_eq!(pacer.delay(), MAX_CHUNK_DELAY);

        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        for _ in 0..500 {
            pacer.record(true);
            assert!(pacer.delay() >= MIN_CHUNK_DELAY);
            assert!(pacer.delay() <= MAX_CHUNK_DELAY);
        }
        assert_eq!(pacer.delay(), MIN_CHUNK_DELAY);
    }

    #[test]
    fn test_middle_band_leaves_delay_unchanged() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, true);
        // 19 of 20 acked is a 95% rate, inside the dead band
        for i in 0..20 {
            pacer.record(i != 0);
        }
        // One early backoff can fire while the rate is still settling;
        // verify the steady state instead of the trajectory.
        let settled = pacer.delay();
        for i in 20..40 {
            pacer.record(i % 20 != 0);
        }
        assert_eq!(pacer.delay(), settled);
    }

    #[test]
    fn test_fixed_mode_never_adapts() {
        let mut pacer = AdaptivePacer::new(DEFAULT_CHUNK_DELAY, false);
        for _ in 0..100 {
            pacer.record(false);
        }
        assert_eq!(pacer.delay(), DEFAULT_CHUNK_DELAY);

        let mut fast = AdaptivePacer::fast();
        for _ in 0..100 {
            fast.record(true);
        }
        assert_eq!(fast.delay(), MIN_CHUNK_DELAY);
    }

    #[test]
    fn test_transfer_timeout_clamps_and_grows() {
        // Small transfers sit on the floor
        assert_eq!(
            transfer_timeout(7, Duration::from_secs(1)),
            MIN_TRANSFER_TIMEOUT
        );
        // Large transfers scale with expected duration
        assert_eq!(
            transfer_timeout(100, Duration::from_secs(1)),
            Duration::from_secs(150)
        );
        // And cap at the ceiling
        assert_eq!(
            transfer_timeout(255, Duration::from_secs(10)),
            MAX_TRANSFER_TIMEOUT
        );

        // Nondecreasing in expected duration
        let mut previous = Duration::ZERO;
        for chunks in 1..=255u8 {
            let t = transfer_timeout(chunks, Duration::from_secs(2));
            assert!(t >= previous);
            previous = t;
        }
    }
}
