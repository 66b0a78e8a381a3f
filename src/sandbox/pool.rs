use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    errors::SandboxError,
    traits::sandbox::Sandbox,
};

/// Bounds how many executions run at once across every submission. Waiters
/// are served in arrival order.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    inner: Arc<dyn Sandbox>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(inner: Arc<dyn Sandbox>, max_concurrency: usize) -> Self {
        let capacity = max_concurrency.max(1);
        Self {
            inner,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Rejects queued and future executions. Running ones finish normally.
    pub fn close(&self) {
        self.slots.close();
    }
}

#[async_trait::async_trait]
impl Sandbox for WorkerPool {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| SandboxError::PoolClosed)?;
        tracing::debug!(
            "Acquired sandbox slot, {} of {} left",
            self.slots.available_permits(),
            self.capacity
        );

        self.inner.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;
    use crate::core::domain::ExecutionOutcome;
    use crate::stubs::sandbox::SandboxStub;

    fn completed() -> ExecutionResult {
        ExecutionResult {
            stdout: "ok\n".to_string(),
            stderr: String::new(),
            exit_status: Some(0),
            wall_time_ms: 5,
            peak_memory_mb: 1.0,
            outcome: ExecutionOutcome::Completed,
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            source_code: "print('ok')".into(),
            language_id: "python".to_string(),
            input: String::new(),
            timeout_seconds: 1,
            memory_limit_mb: 64,
        }
    }

    #[derive(Debug, Default)]
    struct CountingSandbox {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Sandbox for CountingSandbox {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn execute(&self, _: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(completed())
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let counting = Arc::new(CountingSandbox::default());
        let pool = WorkerPool::new(counting.clone(), 2);
        let request = request();

        let results = join_all((0..8).map(|_| pool.execute(&request))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(counting.peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available_slots(), 2);
        assert_eq!(pool.name(), "counting");
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = WorkerPool::new(
            Arc::new(SandboxStub::new(Ok(completed()), Duration::ZERO)),
            1,
        );
        assert_eq!(pool.execute(&request()).await, Ok(completed()));

        pool.close();
        assert_eq!(pool.execute(&request()).await, Err(SandboxError::PoolClosed));
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let pool = WorkerPool::new(
            Arc::new(SandboxStub::new(Ok(completed()), Duration::ZERO)),
            0,
        );
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available_slots(), 1);
    }
}
