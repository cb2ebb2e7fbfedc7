//! Per-device request pacing
//!
//! The [`RateLimiter`] is shared by every component that talks to devices.
//! For each device it bounds the number of requests in flight and enforces a
//! minimum spacing between the starts of successive requests. The spacing
//! starts at the configured base and is re-tuned from the latency the probe
//! measures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

use crate::config::PacingConfig;
use crate::error::{ReconError, Result};
use crate::util::Sharded;

#[derive(Debug)]
struct DeviceSlot {
    permits: Arc<Semaphore>,
    next_start: Mutex<Option<Instant>>,
    spacing_ms: AtomicU64,
}

/// Held for the duration of one request
#[derive(Debug)]
pub struct PacingPermit {
    _permit: OwnedSemaphorePermit,
}

/// Concurrency and spacing limits per device instance
#[derive(Debug)]
pub struct RateLimiter {
    slots: Sharded<HashMap<u32, Arc<DeviceSlot>>>,
    config: PacingConfig,
    closed: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            slots: Sharded::new(config.shard_count),
            config,
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, instance: u32) -> Arc<DeviceSlot> {
        if let Some(slot) = self.slots.read(instance).get(&instance) {
            return Arc::clone(slot);
        }
        let mut shard = self.slots.write(instance);
        let slot = shard.entry(instance).or_insert_with(|| {
            Arc::new(DeviceSlot {
                permits: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
                next_start: Mutex::new(None),
                spacing_ms: AtomicU64::new(self.config.base_spacing.as_millis() as u64),
            })
        });
        Arc::clone(slot)
    }

    /// Wait until a request to `instance` may start
    pub async fn acquire(&self, instance: u32) -> Result<PacingPermit> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReconError::ShutDown);
        }
        let slot = self.slot(instance);
        let permit = Arc::clone(&slot.permits)
            .acquire_owned()
            .await
            .map_err(|_| ReconError::ShutDown)?;

        // Starts are serialized through the lock so spacing holds under concurrency
        let mut next_start = slot.next_start.lock().await;
        if let Some(at) = *next_start {
            if at > Instant::now() {
                trace!("Device {} paced until {:?}", instance, at);
                sleep_until(at).await;
            }
        }
        let spacing = Duration::from_millis(slot.spacing_ms.load(Ordering::Relaxed));
        *next_start = Some(Instant::now() + spacing);

        Ok(PacingPermit { _permit: permit })
    }

    /// Derive the spacing for `instance` from its mean request latency
    pub fn tune(&self, instance: u32, average_latency_ms: f64) -> Duration {
        let wanted_ms = average_latency_ms.max(0.0) * self.config.latency_factor.max(0.0);
        let wanted = Duration::from_millis(wanted_ms.round().min(u64::MAX as f64) as u64);
        let spacing = wanted.clamp(self.config.min_spacing, self.config.max_spacing);
        self.slot(instance)
            .spacing_ms
            .store(spacing.as_millis() as u64, Ordering::Relaxed);
        debug!(
            "Device {} spacing tuned to {:?} (mean latency {:.1} ms)",
            instance, spacing, average_latency_ms
        );
        spacing
    }

    pub fn spacing(&self, instance: u32) -> Duration {
        match self.slots.read(instance).get(&instance) {
            Some(slot) => Duration::from_millis(slot.spacing_ms.load(Ordering::Relaxed)),
            None => self.config.base_spacing,
        }
    }

    /// Requests to `instance` currently holding a permit
    pub fn in_flight(&self, instance: u32) -> usize {
        match self.slots.read(instance).get(&instance) {
            Some(slot) => self
                .config
                .concurrency
                .max(1)
                .saturating_sub(slot.permits.available_permits()),
            None => 0,
        }
    }

    /// Drop the limits kept for `instance`. Permits already handed out stay
    /// valid; the next request starts from the base spacing.
    pub fn forget(&self, instance: u32) -> bool {
        self.slots.write(instance).remove(&instance).is_some()
    }

    /// Devices with limits currently kept
    pub fn tracked(&self) -> usize {
        let mut total = 0;
        self.slots.for_each(|shard| total += shard.len());
        total
    }

    /// Refuse every further request; waiters fail with `ShutDown`
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.for_each(|shard| {
            for slot in shard.values() {
                slot.permits.close();
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::task::JoinSet;

    fn config(concurrency: usize) -> PacingConfig {
        PacingConfig {
            concurrency,
            ..PacingConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_are_spaced() {
        let limiter = RateLimiter::new(config(3));
        let mut starts = Vec::new();
        for _ in 0..4 {
            let _permit = limiter.acquire(1).await.unwrap();
            starts.push(Instant::now());
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(75));
        }

        // Another device is not held back
        let before = Instant::now();
        let _permit = limiter.acquire(2).await.unwrap();
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let limiter = Arc::new(RateLimiter::new(config(2)));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                let _permit = limiter.acquire(9).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(400)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.in_flight(9), 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_a_free_permit() {
        let limiter = RateLimiter::new(PacingConfig {
            concurrency: 1,
            base_spacing: Duration::ZERO,
            ..PacingConfig::default()
        });
        let held = limiter.acquire(3).await.unwrap();

        let mut waiting = tokio_test::task::spawn(limiter.acquire(3));
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(limiter.in_flight(3), 1);

        drop(held);
        assert!(waiting.is_woken());
        tokio_test::assert_ready_ok!(waiting.poll());
    }

    #[test]
    fn test_tuning_is_clamped() {
        let limiter = RateLimiter::new(PacingConfig::default());
        assert_eq!(limiter.spacing(4), Duration::from_millis(75));
        assert_eq!(limiter.tune(4, 20.0), Duration::from_millis(50));
        assert_eq!(limiter.tune(4, 400.0), Duration::from_millis(200));
        assert_eq!(limiter.tune(4, 5000.0), Duration::from_millis(500));
        assert_eq!(limiter.spacing(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_device_starts_over() {
        let limiter = RateLimiter::new(PacingConfig::default());
        drop(limiter.acquire(5).await.unwrap());
        limiter.tune(5, 800.0);
        assert_eq!(limiter.tracked(), 1);

        assert!(limiter.forget(5));
        assert!(!limiter.forget(5));
        assert_eq!(limiter.tracked(), 0);
        assert_eq!(limiter.spacing(5), Duration::from_millis(75));

        // No spacing carried over from before
        let before = Instant::now();
        drop(limiter.acquire(5).await.unwrap());
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test]
    async fn test_closed_limiter_refuses() {
        let limiter = RateLimiter::new(PacingConfig::default());
        drop(limiter.acquire(1).await.unwrap());
        limiter.close();
        limiter.close();
        assert!(matches!(limiter.acquire(1).await, Err(ReconError::ShutDown)));
        assert!(matches!(limiter.acquire(2).await, Err(ReconError::ShutDown)));
    }
}
