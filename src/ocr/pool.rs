//! Bounded pool of equivalent engine instances.
//!
//! Engine handles are expensive to initialise and not safe to drive from two
//! callers at once, so each inference call checks out one instance for its
//! exclusive use and blocks until one is free. A pool of one is the single
//! serialized instance.

use std::sync::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use super::{EngineProfile, OcrEngine};
use crate::error::EngineError;

pub struct EnginePool {
    idle: Mutex<Vec<Box<dyn OcrEngine>>>,
    permits: Semaphore,
    size: usize,
    profile: Option<EngineProfile>,
}

/// Exclusive use of one engine; returned to the pool on drop.
pub struct EngineLease<'a> {
    pool: &'a EnginePool,
    engine: Option<Box<dyn OcrEngine>>,
    _permit: SemaphorePermit<'a>,
}

impl EngineLease<'_> {
    pub fn engine(&self) -> &dyn OcrEngine {
        // Only `Drop` takes the engine out.
        self.engine
            .as_deref()
            .expect("engine lease used after release")
    }
}

impl Drop for EngineLease<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            match self.pool.idle.lock() {
                Ok(mut idle) => idle.push(engine),
                Err(poisoned) => poisoned.into_inner().push(engine),
            }
        }
    }
}

impl EnginePool {
    pub fn new(engines: Vec<Box<dyn OcrEngine>>) -> Self {
        let size = engines.len();
        let profile = engines.first().map(|e| e.profile());
        Self {
            idle: Mutex::new(engines),
            permits: Semaphore::new(size),
            size,
            profile,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Conventions shared by every instance, readable without a lease.
    pub fn profile(&self) -> Result<EngineProfile, EngineError> {
        self.profile.ok_or_else(|| {
            EngineError::Unavailable("no OCR engine instances configured".to_string())
        })
    }

    /// Wait for a free engine.
    pub async fn acquire(&self) -> Result<EngineLease<'_>, EngineError> {
        if self.size == 0 {
            return Err(EngineError::Unavailable(
                "no OCR engine instances configured".to_string(),
            ));
        }
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Unavailable("engine pool closed".to_string()))?;

        let engine = {
            let mut idle = match self.idle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            idle.pop()
        };
        // A permit guarantees an idle engine; an empty list means a lease
        // leaked its engine.
        let engine = engine.ok_or_else(|| {
            EngineError::Unavailable("engine pool exhausted despite free permit".to_string())
        })?;

        Ok(EngineLease {
            pool: self,
            engine: Some(engine),
            _permit: permit,
        })
    }

    /// Probe every instance once and log the outcome. Never fails: an engine
    /// that is down at startup is reported per request instead.
    pub async fn warm_up(&self) {
        // Hold every lease so each instance is probed exactly once.
        let mut leases = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match self.acquire().await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    warn!("Engine pool warm-up aborted: {}", e);
                    break;
                }
            }
        }
        for (n, lease) in leases.iter().enumerate() {
            match lease.engine().health().await {
                Ok(()) => info!("OCR engine {} ({}) is ready", n, lease.engine().name()),
                Err(e) => warn!("OCR engine {} ({}) not ready: {}", n, lease.engine().name(), e),
            }
        }
    }

    /// Shut the pool: pending and future acquisitions fail as unavailable.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{EngineProfile, EngineRequest, RawDetection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct CountingEngine {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl OcrEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn profile(&self) -> EngineProfile {
            EngineProfile::default()
        }

        async fn health(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn detect(&self, _: &EngineRequest) -> Result<Vec<RawDetection>, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn request() -> EngineRequest {
        EngineRequest {
            png: Vec::new(),
            width: 1,
            height: 1,
            language: "en".to_string(),
            mode: crate::schema::ProcessingMode::Ocr,
        }
    }

    #[tokio::test]
    async fn test_single_instance_serializes_calls() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(EnginePool::new(vec![Box::new(CountingEngine {
            active: active.clone(),
            peak: peak.clone(),
        })]));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                lease.engine().detect(&request()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency_to_size() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let engines: Vec<Box<dyn OcrEngine>> = (0..2)
            .map(|_| {
                Box::new(CountingEngine {
                    active: active.clone(),
                    peak: peak.clone(),
                }) as Box<dyn OcrEngine>
            })
            .collect();
        let pool = Arc::new(EnginePool::new(engines));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                lease.engine().detect(&request()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.idle.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_or_closed_pool_is_unavailable() {
        let empty = EnginePool::new(Vec::new());
        assert!(empty.profile().is_err());
        assert!(matches!(
            empty.acquire().await,
            Err(EngineError::Unavailable(_))
        ));

        let active = Arc::new(AtomicUsize::new(0));
        let closed = EnginePool::new(vec![Box::new(CountingEngine {
            active: active.clone(),
            peak: active,
        })]);
        closed.close();
        assert!(matches!(
            closed.acquire().await,
            Err(EngineError::Unavailable(_))
        ));
    }
}
