//! Background job plumbing.
//!
//! A [`Worker`] runs one fallible async job and reports its outcome as
//! events: `Result` or `Error`, then exactly one `Finished`. [`CancelFlag`]
//! is the cooperative stop shared between the job and whoever supervises it;
//! runners check it once per iteration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEvent<T> {
    Result(T),
    Error(String),
    Finished,
}

/// Shared cooperative cancellation token.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Worker<T> {
    handle: JoinHandle<()>,
    events: mpsc::UnboundedReceiver<WorkerEvent<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `job` and stream its outcome.
    pub fn spawn<F>(job: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            match job.await {
                Ok(value) => {
                    let _ = tx.send(WorkerEvent::Result(value));
                }
                Err(e) => {
                    log::error!("worker failed: {e:#}");
                    let _ = tx.send(WorkerEvent::Error(format!("{e:#}")));
                }
            }
            let _ = tx.send(WorkerEvent::Finished);
        });
        Self { handle, events }
    }

    /// Next event; `None` once the worker is gone and drained.
    pub async fn next_event(&mut self) -> Option<WorkerEvent<T>> {
        self.events.recv().await
    }

    /// Wait for completion and return the job's value.
    pub async fn join(mut self) -> anyhow::Result<T> {
        let mut outcome = None;
        while let Some(event) = self.events.recv().await {
            match event {
                WorkerEvent::Result(value) => outcome = Some(Ok(value)),
                WorkerEvent::Error(message) => outcome = Some(Err(anyhow::anyhow!(message))),
                WorkerEvent::Finished => break,
            }
        }
        self.handle.await.ok();
        outcome.unwrap_or_else(|| Err(anyhow::anyhow!("worker vanished without an outcome")))
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_result_then_finished() {
        let mut worker = Worker::spawn(async { Ok(42) });
        assert_eq!(worker.next_event().await, Some(WorkerEvent::Result(42)));
        assert_eq!(worker.next_event().await, Some(WorkerEvent::Finished));
        assert_eq!(worker.next_event().await, None);
    }

    #[tokio::test]
    async fn emits_error_then_finished() {
        let mut worker: Worker<()> = Worker::spawn(async { anyhow::bail!("boom") });
        match worker.next_event().await {
            Some(WorkerEvent::Error(message)) => assert!(message.contains("boom")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(worker.next_event().await, Some(WorkerEvent::Finished));
    }

    #[tokio::test]
    async fn join_returns_the_value() {
        let worker = Worker::spawn(async { Ok("done".to_string()) });
        assert_eq!(worker.join().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let seen = flag.clone();
        assert!(!seen.is_cancelled());
        flag.cancel();
        assert!(seen.is_cancelled());
    }
}
