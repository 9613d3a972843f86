//! Adaptive batch delay.
//!
//! The delay between damage intake and encoding stretches when the
//! feedback loop sees congestion (rising round-trip or decode times,
//! in-flight frames at the cap, bandwidth over budget, queue pressure)
//! and shrinks again once the link has been quiet: additive increase,
//! multiplicative decrease, clamped to `[min_ms, max_ms]`.

use std::time::Duration;

use tokio::time::Instant;

pub const BATCH_MIN_MS: u64 = 0;
pub const BATCH_MAX_MS: u64 = 250;

/// Smoothing weight: new samples contribute 1/4.
const EWMA_BASE: f64 = 4.0;
const EWMA_ALPHA: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    /// Additive increase per congested ack.
    pub step_ms: u64,
    /// Quiet time before each halving of the delay.
    pub idle_halve_after: Duration,
    /// Round trips above this multiple of the best observed one count as
    /// congestion.
    pub rtt_congestion_factor: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            min_ms: BATCH_MIN_MS,
            max_ms: BATCH_MAX_MS,
            step_ms: 10,
            idle_halve_after: Duration::from_secs(1),
            rtt_congestion_factor: 1.5,
        }
    }
}

/// One ack's worth of feedback signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckSample {
    pub rtt_ms: u64,
    pub decode_time_us: u64,
    /// write completion minus enqueue, network side.
    pub send_time_ms: u64,
    pub inflight: usize,
    pub inflight_cap: usize,
    pub backpressure: bool,
    pub bandwidth_used_bps: u64,
    pub bandwidth_limit_bps: u64,
}

#[derive(Debug)]
pub struct BatchDelay {
    config: BatchConfig,
    delay_ms: u64,
    srtt_ms: f64,
    min_rtt_ms: f64,
    sdecode_us: f64,
    last_congested: Option<Instant>,
    last_halved: Option<Instant>,
}

impl BatchDelay {
    pub fn new(config: BatchConfig) -> BatchDelay {
        BatchDelay {
            delay_ms: config.min_ms,
            config,
            srtt_ms: 0.0,
            min_rtt_ms: f64::MAX,
            sdecode_us: 0.0,
            last_congested: None,
            last_halved: None,
        }
    }

    fn ewma(current: f64, sample: f64) -> f64 {
        if current == 0.0 {
            sample
        } else {
            ((EWMA_BASE - EWMA_ALPHA) * current + EWMA_ALPHA * sample) / EWMA_BASE
        }
    }

    pub fn srtt_ms(&self) -> f64 {
        self.srtt_ms
    }

    pub fn sdecode_us(&self) -> f64 {
        self.sdecode_us
    }

    /// Folds one ack into the estimators and applies additive increase if
    /// the sample shows congestion.
    pub fn on_ack(&mut self, now: Instant, sample: &AckSample) {
        self.srtt_ms = Self::ewma(self.srtt_ms, sample.rtt_ms as f64);
        self.min_rtt_ms = self.min_rtt_ms.min(sample.rtt_ms.max(1) as f64);
        self.sdecode_us = Self::ewma(self.sdecode_us, sample.decode_time_us as f64);

        let rtt_high = self.srtt_ms > self.min_rtt_ms * self.config.rtt_congestion_factor;
        let inflight_full =
            sample.inflight_cap > 0 && sample.inflight >= sample.inflight_cap;
        let over_budget = sample.bandwidth_limit_bps > 0
            && sample.bandwidth_used_bps > sample.bandwidth_limit_bps;
        let send_slow = sample.send_time_ms as f64 > self.srtt_ms.max(1.0);

        if rtt_high || inflight_full || over_budget || sample.backpressure || send_slow {
            self.delay_ms = (self.delay_ms + self.config.step_ms).min(self.config.max_ms);
            self.last_congested = Some(now);
        }
    }

    /// Current delay; a sustained quiet streak halves it, repeatedly.
    pub fn delay(&mut self, now: Instant) -> Duration {
        let quiet_since = self.last_congested.max(self.last_halved);
        let quiet = match quiet_since {
            Some(t) => now.saturating_duration_since(t) >= self.config.idle_halve_after,
            // Never congested: stay at the floor.
            None => false,
        };
        if quiet && self.delay_ms > self.config.min_ms {
            self.delay_ms = (self.delay_ms / 2).max(self.config.min_ms);
            self.last_halved = Some(now);
        }
        Duration::from_millis(self.delay_ms)
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn congested() -> AckSample {
        AckSample {
            rtt_ms: 300,
            decode_time_us: 2000,
            inflight: 3,
            inflight_cap: 3,
            ..Default::default()
        }
    }

    fn quiet() -> AckSample {
        AckSample {
            rtt_ms: 10,
            decode_time_us: 1000,
            inflight: 0,
            inflight_cap: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_starts_at_floor() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        assert_eq!(batch.delay(Instant::now()), Duration::from_millis(0));
    }

    #[test]
    fn test_additive_increase_clamps() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        let now = Instant::now();
        // Establish a low baseline rtt, then congest.
        batch.on_ack(now, &quiet());
        for _ in 0..100 {
            batch.on_ack(now, &congested());
        }
        assert_eq!(batch.delay_ms(), BATCH_MAX_MS);
    }

    #[test]
    fn test_inflight_cap_counts_as_congestion() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        let now = Instant::now();
        batch.on_ack(
            now,
            &AckSample {
                rtt_ms: 1,
                inflight: 10,
                inflight_cap: 10,
                ..Default::default()
            },
        );
        assert!(batch.delay_ms() > 0);
    }

    #[test]
    fn test_bandwidth_over_budget_counts() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        batch.on_ack(
            Instant::now(),
            &AckSample {
                rtt_ms: 1,
                inflight_cap: 10,
                bandwidth_used_bps: 2_000_000,
                bandwidth_limit_bps: 1_000_000,
                ..Default::default()
            },
        );
        assert!(batch.delay_ms() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_streak_halves_repeatedly() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        let now = Instant::now();
        batch.on_ack(now, &quiet());
        for _ in 0..8 {
            batch.on_ack(now, &congested());
        }
        let high = batch.delay_ms();
        assert!(high >= 80);

        tokio::time::advance(Duration::from_millis(1100)).await;
        let d1 = batch.delay(Instant::now()).as_millis() as u64;
        assert_eq!(d1, high / 2);
        // Still quiet one second later: halves again.
        tokio::time::advance(Duration::from_millis(1100)).await;
        let d2 = batch.delay(Instant::now()).as_millis() as u64;
        assert_eq!(d2, d1 / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_within_window_keeps_delay() {
        let mut batch = BatchDelay::new(BatchConfig::default());
        let now = Instant::now();
        batch.on_ack(now, &quiet());
        batch.on_ack(now, &congested());
        let d = batch.delay_ms();
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(batch.delay(Instant::now()).as_millis() as u64, d);
    }
}
