//! Per-bucket job serializer.
//!
//! Jobs enqueued under the same bucket key run strictly one at a time in
//! arrival order; different buckets run independently. The primary use
//! is serializing Signal session IO per peer address so no two
//! operations mutate the same session concurrently.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default hard timeout per job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(15);

/// Shrink the drained queue every this many completed jobs.
const DRAIN_COMPACT_EVERY: u64 = 10_000;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct Bucket {
    queue: VecDeque<Job>,
    running: bool,
    drained: u64,
}

pub struct JobQueue {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    timeout: Duration,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TIMEOUT)
    }
}

impl JobQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Enqueue `work` under `bucket` and await its result. The job runs
    /// once every earlier job in the bucket has completed or timed out;
    /// exceeding the queue timeout fails the job and the executor moves
    /// on to the next one.
    pub async fn enqueue<T, F, Fut>(&self, bucket: &str, work: F) -> crate::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<T>> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let timeout = self.timeout;
        let job: Job = Box::pin(async move {
            let outcome = match tokio::time::timeout(timeout, work()).await {
                Ok(result) => result,
                Err(_) => Err(crate::Error::Timeout),
            };
            let _ = tx.send(outcome);
        });

        let start_executor = {
            let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let entry = buckets.entry(bucket.to_string()).or_default();
            entry.queue.push_back(job);
            if entry.running {
                false
            } else {
                entry.running = true;
                true
            }
        };
        if start_executor {
            tokio::spawn(Self::run_bucket(
                Arc::clone(&self.buckets),
                bucket.to_string(),
            ));
        }

        rx.await
            .unwrap_or_else(|_| Err(crate::Error::Timeout))
    }

    /// Executor for one bucket: pops in arrival order until the queue is
    /// empty, then removes the bucket entry atomically.
    async fn run_bucket(buckets: Arc<Mutex<HashMap<String, Bucket>>>, key: String) {
        loop {
            let job = {
                let mut map = buckets.lock().unwrap_or_else(|e| e.into_inner());
                let Some(bucket) = map.get_mut(&key) else {
                    return;
                };
                match bucket.queue.pop_front() {
                    Some(job) => {
                        bucket.drained += 1;
                        if bucket.drained % DRAIN_COMPACT_EVERY == 0 {
                            // bound the backing allocation on long-lived buckets
                            bucket.queue.shrink_to_fit();
                            tracing::trace!(bucket = %key, drained = bucket.drained, "compacted job queue");
                        }
                        job
                    }
                    None => {
                        map.remove(&key);
                        return;
                    }
                }
            };
            job.await;
        }
    }

    /// Number of live buckets (test/diagnostic helper).
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn jobs_in_one_bucket_run_serially() {
        let queue = Arc::new(JobQueue::default());
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            let running = running.clone();
            let overlaps = overlaps.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue("peer.0", move || async move {
                        if running.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        running.store(false, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn results_come_back_in_arrival_order() {
        let queue = Arc::new(JobQueue::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..8usize {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue("bucket", move || async move {
                        order.lock().unwrap().push(i);
                        Ok(i)
                    })
                    .await
            }));
            // give the spawn a chance to enqueue before the next
            tokio::task::yield_now().await;
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap().unwrap(), i);
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn timed_out_job_fails_and_queue_continues() {
        let queue = Arc::new(JobQueue::new(Duration::from_millis(20)));
        let q = queue.clone();
        let slow = tokio::spawn(async move {
            q.enqueue("peer", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await
        });
        tokio::task::yield_now().await;
        let fast = queue.enqueue("peer", || async { Ok(2) });
        assert!(matches!(slow.await.unwrap(), Err(crate::Error::Timeout)));
        assert_eq!(fast.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn bucket_entry_removed_when_empty() {
        let queue = JobQueue::default();
        queue.enqueue("gone", || async { Ok(()) }).await.unwrap();
        // the executor removes the bucket after draining
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.bucket_count(), 0);
    }

    #[tokio::test]
    async fn buckets_do_not_block_each_other() {
        let queue = Arc::new(JobQueue::default());
        let q = queue.clone();
        let blocked = tokio::spawn(async move {
            q.enqueue("slow-bucket", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;
        let start = std::time::Instant::now();
        queue.enqueue("fast-bucket", || async { Ok(()) }).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(40));
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn drains_past_compaction_threshold() {
        let queue = Arc::new(JobQueue::default());
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(10_001);
        for _ in 0..10_001usize {
            let queue = queue.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue("big", move || async move {
                        done.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(done.load(Ordering::Relaxed), 10_001);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.bucket_count(), 0);
    }
}
