//! Serialization of compile jobs.
//!
//! Compilation is memory-hungry on big posts and every cache miss
//! wants to run one, so jobs go through a single-permit queue with a
//! per-job timeout. Queue position does not count against the timeout.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

pub struct CompileQueue {
    permits: Semaphore,
    timeout: Duration,
}

impl CompileQueue {
    pub fn new(timeout: Duration) -> Self {
        CompileQueue {
            permits: Semaphore::new(1),
            timeout,
        }
    }

    /// Runs `job` once the queue is free, failing it when it exceeds
    /// the timeout.
    pub async fn run<T, F, Fut>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.permits.acquire().await.unwrap(); // never closed
        match tokio::time::timeout(self.timeout, job()).await {
            Ok(result) => result,
            Err(_) => Err(Error::CompileTimeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_never_overlap() {
        let queue = Arc::new(CompileQueue::new(Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(|| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_times_out() {
        let queue = CompileQueue::new(Duration::from_secs(30));
        let result: Result<()> = queue
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(31)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CompileTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_recovers_after_a_timeout() {
        let queue = CompileQueue::new(Duration::from_secs(30));
        let _: Result<()> = queue
            .run(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        let got = queue.run(|| async { Ok("fine") }).await.unwrap();
        assert_eq!(got, "fine");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_in_line_does_not_count_against_the_timeout() {
        let queue = Arc::new(CompileQueue::new(Duration::from_secs(30)));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(|| async {
                        tokio::time::sleep(Duration::from_secs(25)).await;
                        Ok("first")
                    })
                    .await
            })
        };
        // Second job waits ~25s in line, then needs 25s itself.
        let second = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(|| async {
                        tokio::time::sleep(Duration::from_secs(25)).await;
                        Ok("second")
                    })
                    .await
            })
        };

        assert_eq!(first.await.unwrap().unwrap(), "first");
        assert_eq!(second.await.unwrap().unwrap(), "second");
    }
}
