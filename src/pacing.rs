use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::{AppConfig, PacingStrategy};
use crate::geocode::GeocodeOutcome;

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Gate the resolver passes through before every provider request.
#[async_trait]
pub trait PacingGate: Send + Sync {
    async fn wait(&self);

    /// Feedback from the request that followed the last `wait`.
    fn observe(&self, _outcome: &GeocodeOutcome) {}
}

pub fn gate_from_config(config: &AppConfig) -> Arc<dyn PacingGate> {
    let interval = Duration::from_millis(config.geocode_pacing_ms);
    match config.geocode_pacing {
        PacingStrategy::Fixed => Arc::new(FixedIntervalGate::new(interval)),
        PacingStrategy::Backoff => Arc::new(BackoffGate::new(
            interval,
            Duration::from_millis(config.geocode_backoff_max_ms),
            StdRng::from_entropy(),
        )),
    }
}

#[derive(Debug, Default)]
pub struct NoopGate;

#[async_trait]
impl PacingGate for NoopGate {
    async fn wait(&self) {}
}

/// Keeps consecutive requests at least `interval` apart.
pub struct FixedIntervalGate {
    interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl FixedIntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn wait_for(&self, extra: Duration) {
        let spacing = self.interval + extra;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < spacing {
                sleep(spacing - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[async_trait]
impl PacingGate for FixedIntervalGate {
    async fn wait(&self) {
        self.wait_for(Duration::ZERO).await;
    }
}

/// Fixed spacing plus exponential delay after consecutive rate-limited responses.
/// It only slows later requests down; the rate-limited row is not retried.
pub struct BackoffGate {
    spacing: FixedIntervalGate,
    base: Duration,
    max_delay: Duration,
    strikes: AtomicU32,
    jitter_rng: Mutex<StdRng>,
}

impl BackoffGate {
    pub fn new(interval: Duration, max_delay: Duration, rng: StdRng) -> Self {
        Self {
            spacing: FixedIntervalGate::new(interval),
            base: interval.max(Duration::from_millis(250)),
            max_delay,
            strikes: AtomicU32::new(0),
            jitter_rng: Mutex::new(rng),
        }
    }

    pub fn strikes(&self) -> u32 {
        self.strikes.load(Ordering::SeqCst)
    }

    /// Extra delay owed before the next request; zero until a rate limit is seen.
    pub fn backoff_delay(&self) -> Duration {
        let strikes = self.strikes();
        if strikes == 0 {
            return Duration::ZERO;
        }
        let exponent = (strikes - 1).min(MAX_BACKOFF_EXPONENT);
        let base = self.base * (1 << exponent);
        let jitter_ceiling = self.base.as_millis().max(1) as u64;
        let jitter = Duration::from_millis(self.jitter_rng.lock().gen_range(0..jitter_ceiling));
        (base + jitter).min(self.max_delay)
    }
}

#[async_trait]
impl PacingGate for BackoffGate {
    async fn wait(&self) {
        let extra = self.backoff_delay();
        if !extra.is_zero() {
            debug!(strikes = self.strikes(), delay = ?extra, "backing off after rate limit");
        }
        self.spacing.wait_for(extra).await;
    }

    fn observe(&self, outcome: &GeocodeOutcome) {
        match outcome {
            GeocodeOutcome::RateLimited => {
                self.strikes.fetch_add(1, Ordering::SeqCst);
            }
            // No request went out, so nothing was learned about the quota.
            GeocodeOutcome::NoAddressField => {}
            _ => self.strikes.store(0, Ordering::SeqCst),
        }
    }
}
