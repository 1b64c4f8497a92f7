use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{JobError, PoolError};

/// Fixed-size pool of workers pulling jobs off a shared queue.
#[derive(Debug, Clone, Copy)]
pub struct SizablePool {
    size: usize,
}

/// Every item was handled and every worker has run out of work.
#[derive(Debug)]
pub struct PoolReport {
    pub handled: usize,
}

/// `start` failed fast. Workers that were mid-item when the first error
/// arrived may still be running; they have been signalled to stop and can be
/// joined through `draining`.
#[derive(Debug)]
pub struct PoolFailure {
    pub error: PoolError,
    pub draining: Drain,
}

/// Background tasks left behind by a pool that returned early.
#[derive(Debug, Default)]
pub struct Drain {
    workers: Vec<JoinHandle<()>>,
}

impl Drain {
    /// Tasks that have not exited yet.
    pub fn in_flight(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Waits until every task from the failed run has exited.
    pub async fn wait(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    warn!(error = %e, "Pool worker panicked while draining");
                }
            }
        }
    }
}

impl SizablePool {
    /// Sizes below one are clamped to a single worker.
    pub fn new(size: i64) -> Self {
        let size = usize::try_from(size.max(1)).unwrap_or(usize::MAX);
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `handler` once per item, at most `size` at a time, dispatching in
    /// item order.
    ///
    /// Returns on the first of: `cancel` firing, any handler error, or every
    /// item succeeding. The handler's token is a child of `cancel` that is
    /// cancelled when this call returns, so in-flight handlers are asked to
    /// stop but not awaited.
    pub async fn start<T, H, Fut>(
        &self,
        cancel: &CancellationToken,
        items: Vec<T>,
        handler: H,
    ) -> Result<PoolReport, PoolFailure>
    where
        T: Send + 'static,
        H: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        if items.is_empty() {
            return Err(PoolFailure {
                error: PoolError::EmptyInput,
                draining: Drain::default(),
            });
        }

        let total = items.len();
        let pool_token = cancel.child_token();
        let _stop_workers = pool_token.clone().drop_guard();
        debug!(workers = self.size, items = total, "Starting worker pool");

        let (job_tx, job_rx) = mpsc::channel::<T>(self.size);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Result<(), JobError>>();

        let mut workers = Vec::with_capacity(self.size + 1);

        let producer_token = pool_token.clone();
        workers.push(tokio::spawn(async move {
            for item in items {
                tokio::select! {
                    _ = producer_token.cancelled() => return,
                    sent = job_tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }));

        let job_rx = Arc::new(Mutex::new(job_rx));
        let handler = Arc::new(handler);
        for _ in 0..self.size {
            let job_rx = Arc::clone(&job_rx);
            let handler = Arc::clone(&handler);
            let events = event_tx.clone();
            let token = pool_token.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut queue = job_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => None,
                            item = queue.recv() => item,
                        }
                    };
                    let Some(item) = next else { break };
                    if token.is_cancelled() {
                        break;
                    }
                    let result = (*handler)(token.clone(), item).await;
                    if events.send(result).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(event_tx);

        let mut handled = 0;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(PoolError::Cancelled),
                event = event_rx.recv() => match event {
                    Some(Ok(())) => {
                        handled += 1;
                        if handled == total {
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => break Err(PoolError::Job(e)),
                    None if cancel.is_cancelled() => break Err(PoolError::Cancelled),
                    None => break Err(PoolError::Abandoned { missing: total - handled }),
                },
            }
        };

        match outcome {
            Ok(()) => Ok(PoolReport { handled }),
            Err(error) => Err(PoolFailure {
                error,
                draining: Drain { workers },
            }),
        }
    }
}
