//! Per-domain politeness: an in-flight cap and minimum request spacing.
//!
//! One [`DomainLimiter`] is shared by every crawl in the process, so the cap
//! holds across sources that happen to point at the same host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use gleaner_shared::{GleanerError, Result};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

#[derive(Debug)]
struct DomainSlot {
    permits: Arc<Semaphore>,
    next_allowed: Mutex<Option<Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Caps concurrent requests per host and spaces their start times.
#[derive(Debug)]
pub struct DomainLimiter {
    per_domain: usize,
    slots: StdMutex<HashMap<String, Arc<DomainSlot>>>,
}

/// Held for the duration of one request.
#[derive(Debug)]
pub struct DomainPermit {
    slot: Arc<DomainSlot>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DomainLimiter {
    pub fn new(per_domain: u32) -> Self {
        Self {
            per_domain: per_domain.max(1) as usize,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &str) -> Arc<DomainSlot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(host.to_ascii_lowercase())
            .or_insert_with(|| {
                Arc::new(DomainSlot {
                    permits: Arc::new(Semaphore::new(self.per_domain)),
                    next_allowed: Mutex::new(None),
                    in_flight: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Wait for a slot on `host`, then until at least `spacing` has passed
    /// since the previous request to it started.
    pub async fn acquire(&self, host: &str, spacing: Duration) -> Result<DomainPermit> {
        let slot = self.slot(host);
        let permit = slot
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| GleanerError::Network(format!("domain limiter closed: {e}")))?;

        {
            let mut next = slot.next_allowed.lock().await;
            if let Some(at) = *next {
                tokio::time::sleep_until(at).await;
            }
            *next = Some(Instant::now() + spacing);
        }

        let now_in_flight = slot.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        slot.peak.fetch_max(now_in_flight, Ordering::SeqCst);

        Ok(DomainPermit {
            slot,
            _permit: permit,
        })
    }

    /// Highest number of simultaneous requests ever observed for `host`.
    pub fn peak_in_flight(&self, host: &str) -> usize {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .get(&host.to_ascii_lowercase())
            .map_or(0, |s| s.peak.load(Ordering::SeqCst))
    }

    pub fn in_flight(&self, host: &str) -> usize {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .get(&host.to_ascii_lowercase())
            .map_or(0, |s| s.in_flight.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_domain_cap_holds_under_load() {
        let limiter = Arc::new(DomainLimiter::new(2));
        let mut tasks = tokio::task::JoinSet::new();

        for i in 0..16 {
            let limiter = limiter.clone();
            let host = if i % 4 == 0 { "other.example" } else { "example.org" };
            tasks.spawn(async move {
                let _permit = limiter.acquire(host, Duration::ZERO).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        assert_eq!(limiter.peak_in_flight("example.org"), 2);
        assert!(limiter.peak_in_flight("other.example") <= 2);
        assert_eq!(limiter.in_flight("example.org"), 0);
        assert_eq!(limiter.peak_in_flight("never.seen"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_are_spaced() {
        let limiter = DomainLimiter::new(4);
        let start = Instant::now();

        drop(limiter.acquire("example.org", Duration::from_millis(500)).await.unwrap());
        drop(limiter.acquire("example.org", Duration::from_millis(500)).await.unwrap());
        drop(limiter.acquire("example.org", Duration::from_millis(500)).await.unwrap());

        assert!(start.elapsed() >= Duration::from_millis(1000));

        // Other hosts are not delayed.
        let before = Instant::now();
        drop(limiter.acquire("example.net", Duration::from_millis(500)).await.unwrap());
        assert!(before.elapsed() < Duration::from_millis(500));
    }
}
