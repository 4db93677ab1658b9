//! Admission limiter: a token bucket whose capacity grows gradually after
//! startup, so a freshly booted gateway is not flooded by reconnecting
//! clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

/// Token bucket settings.
///
/// Growing from the defaults takes `(50000 - 2000) / 500 * 2s`, about 3.2
/// minutes. Small deployments want something like 500/10000, large ones
/// 5000/100000.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    pub init_capacity: usize,
    pub max_capacity: usize,
    pub increase_step: usize,
    pub increase_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            init_capacity: 2000,
            max_capacity: 50_000,
            increase_step: 500,
            increase_interval: Duration::from_secs(2),
        }
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.init_capacity == 0 {
            return Err(GatewayError::Config(
                "init capacity must be greater than 0".into(),
            ));
        }
        if self.max_capacity < self.init_capacity {
            return Err(GatewayError::Config(
                "max capacity must not be less than init capacity".into(),
            ));
        }
        if self.increase_step == 0 {
            return Err(GatewayError::Config(
                "increase step must be greater than 0".into(),
            ));
        }
        if self.increase_interval.is_zero() {
            return Err(GatewayError::Config(
                "increase interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Admission token bucket. `acquire`/`release` are non-blocking; a background
/// task raises the capacity step by step until it hits the maximum.
pub struct TokenBucket {
    cfg: TokenBucketConfig,
    tokens: Semaphore,
    curr_capacity: AtomicUsize,
    token: CancellationToken,
}

impl TokenBucket {
    pub fn new(cfg: TokenBucketConfig) -> Result<Self> {
        cfg.validate()?;
        let tokens = Semaphore::new(cfg.init_capacity);
        let curr_capacity = AtomicUsize::new(cfg.init_capacity);
        info!(
            init_capacity = cfg.init_capacity,
            max_capacity = cfg.max_capacity,
            "token bucket initialized"
        );
        Ok(Self {
            cfg,
            tokens,
            curr_capacity,
            token: CancellationToken::new(),
        })
    }

    /// Take one token. Returns false immediately when none are available.
    pub fn acquire(&self) -> bool {
        match self.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return a token. Dropped with a warning when the bucket is already
    /// full, which means release has been called more often than acquire.
    pub fn release(&self) {
        if self.tokens.available_permits() >= self.curr_capacity.load(Ordering::Acquire) {
            warn!("failed to release token, bucket is full");
            return;
        }
        self.tokens.add_permits(1);
    }

    /// Grow the capacity every `increase_interval` until it reaches the
    /// maximum, the caller's token fires, or the bucket is closed.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.increase_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // The first tick fires immediately; skip it.

        info!("token bucket capacity growth started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("outer shutdown, stopping capacity growth");
                    return;
                }
                _ = self.token.cancelled() => {
                    info!("token bucket closed, stopping capacity growth");
                    return;
                }
                _ = ticker.tick() => {
                    let curr = self.curr_capacity.load(Ordering::Acquire);
                    if curr >= self.cfg.max_capacity {
                        info!("capacity reached max, stopping capacity growth");
                        return;
                    }
                    let next = (curr + self.cfg.increase_step).min(self.cfg.max_capacity);
                    self.tokens.add_permits(next - curr);
                    self.curr_capacity.store(next, Ordering::Release);
                    info!(from = curr, to = next, "token bucket capacity increased");
                }
            }
        }
    }

    pub fn close(&self) {
        self.token.cancel();
        info!("token bucket closed");
    }

    /// Current nominal capacity.
    pub fn cap(&self) -> usize {
        self.curr_capacity.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_bucket(init: usize, max: usize) -> TokenBucket {
        TokenBucket::new(TokenBucketConfig {
            init_capacity: init,
            max_capacity: max,
            increase_step: 1,
            increase_interval: Duration::from_millis(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn acquire_exhausts_then_release_restores() {
        let bucket = small_bucket(2, 2);
        assert!(bucket.acquire());
        assert!(bucket.acquire());
        assert!(!bucket.acquire());

        bucket.release();
        assert!(bucket.acquire());
    }

    #[tokio::test]
    async fn release_beyond_capacity_is_dropped() {
        let bucket = small_bucket(1, 1);
        bucket.release();
        bucket.release();
        // Still only one token available.
        assert!(bucket.acquire());
        assert!(!bucket.acquire());
    }

    #[tokio::test]
    async fn capacity_grows_to_max() {
        let bucket = std::sync::Arc::new(small_bucket(1, 4));
        let shutdown = CancellationToken::new();
        let runner = {
            let bucket = bucket.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bucket.run(shutdown).await })
        };

        runner.await.unwrap(); // Returns by itself once capacity hits max.
        assert_eq!(bucket.cap(), 4);

        // All four tokens are there.
        for _ in 0..4 {
            assert!(bucket.acquire());
        }
        assert!(!bucket.acquire());
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        assert!(TokenBucket::new(TokenBucketConfig {
            init_capacity: 0,
            ..Default::default()
        })
        .is_err());
        assert!(TokenBucket::new(TokenBucketConfig {
            init_capacity: 10,
            max_capacity: 5,
            ..Default::default()
        })
        .is_err());
    }
}
