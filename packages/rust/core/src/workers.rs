//! Bounded pool for CPU-bound work (extraction, scoring).

use std::sync::Arc;

use tokio::sync::Semaphore;

use gleaner_shared::{GleanerError, Result};

/// Runs closures on tokio's blocking threads, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(workers: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1) as usize)),
        }
    }

    /// Run `f` once a worker is free. A panic inside `f` becomes the error
    /// built by `on_panic`.
    pub async fn run<T, F, P>(&self, f: F, on_panic: P) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        P: FnOnce(String) -> GleanerError,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GleanerError::Cancelled)?;
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(on_panic(panic_message(e.into_panic()))),
            Err(_) => Err(GleanerError::Cancelled),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn returns_closure_result() {
        let pool = BlockingPool::new(2);
        let v = pool.run(|| Ok(21 * 2), GleanerError::Evaluation).await.unwrap();
        assert_eq!(v, 42);
        let err = pool
            .run(|| -> Result<()> { Err(GleanerError::extraction("bad")) }, GleanerError::Evaluation)
            .await
            .unwrap_err();
        assert!(matches!(err, GleanerError::Extraction { .. }));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let pool = BlockingPool::new(1);
        let err = pool
            .run(|| -> Result<()> { panic!("boom") }, |m| GleanerError::extraction(m))
            .await
            .unwrap_err();
        match err {
            GleanerError::Extraction { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn bounded_parallelism() {
        let pool = BlockingPool::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                pool.run(
                    move || {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    GleanerError::Evaluation,
                )
                .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
