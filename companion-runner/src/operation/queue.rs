// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named serial queues.
//!
//! A [`SerialQueue`] is an owned worker task draining a channel of submitted
//! jobs one at a time. Targets use one as their work queue so that mutating
//! operations never interleave; storage sub-stores use one each so ingests
//! serialize per store while distinct stores proceed concurrently.

use super::{OpValue, Operation};
use crate::errors::{CompanionError, CompanionResult};
use smol_str::SmolStr;
use std::future::Future;
use tokio::sync::mpsc;

type Job = futures::future::BoxFuture<'static, ()>;

/// A serial executor identified by name.
///
/// Jobs run strictly in submission order; a job does not start until the
/// previous one has finished. Dropping the queue lets in-flight jobs finish
/// and fails jobs that were never started.
#[derive(Clone, Debug)]
pub struct SerialQueue {
    name: SmolStr,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Creates the queue and spawns its worker task.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            tracing::debug!(queue = %worker_name, "serial queue started");
            while let Some(job) = receiver.recv().await {
                job.await;
            }
            tracing::debug!(queue = %worker_name, "serial queue drained");
        });
        Self { name, sender }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits `work` and returns the operation for its result.
    ///
    /// If the operation is cancelled before its turn comes, the job is
    /// skipped; cancellation of a running job stops it at its next
    /// suspension point.
    pub fn enqueue<T, F>(&self, name: impl Into<SmolStr>, work: F) -> Operation<T>
    where
        T: OpValue,
        F: Future<Output = CompanionResult<T>> + Send + 'static,
    {
        let (resolver, operation) = Operation::resolver(name);
        let signal = operation.clone();
        let job: Job = Box::pin(async move {
            if resolver.is_cancel_requested() {
                resolver.disarm();
                return;
            }
            tokio::select! {
                biased;
                _ = signal.cancellation_requested() => resolver.disarm(),
                result = work => resolver.resolve_result(result),
            }
        });
        if self.sender.send(job).is_err() {
            // The worker is gone; the job (and its resolver) was returned in
            // the send error and dropped, failing the operation. Replace the
            // generic abandonment error with a queue-specific one.
            return Operation::failed(CompanionError::Internal(format!(
                "serial queue `{}` has shut down",
                self.name
            )));
        }
        operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[tokio::test]
    async fn jobs_run_in_submission_order_without_overlap() {
        let queue = SerialQueue::new("test-queue");
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let first = {
            let log = log.clone();
            queue.enqueue("first", async move {
                log.lock().unwrap().push("first-start");
                // Yield so an overlapping second job would get a chance to
                // run before this one finishes.
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("first-end");
                Ok(())
            })
        };
        let second = {
            let log = log.clone();
            queue.enqueue("second", async move {
                log.lock().unwrap().push("second");
                Ok(())
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first-start", "first-end", "second"]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_is_skipped() {
        let queue = SerialQueue::new("skip-queue");
        let ran = Arc::new(Mutex::new(false));

        // Occupy the queue so the second job cannot start yet.
        let blocker = queue.enqueue("blocker", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let skipped = {
            let ran = ran.clone();
            queue.enqueue("skipped", async move {
                *ran.lock().unwrap() = true;
                Ok(())
            })
        };

        skipped.cancel().await.unwrap();
        blocker.await.unwrap();
        // Give the worker a moment to pull (and skip) the cancelled job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!*ran.lock().unwrap());
    }
}
