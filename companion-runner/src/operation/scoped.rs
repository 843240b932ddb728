// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operations paired with scoped resource teardown.
//!
//! Almost every companion operation touches a resource whose release is
//! distinct from result delivery: a temporary directory, a service
//! connection, a subprocess, a stream. A [`ScopedOperation`] carries such a
//! resource together with a teardown that is guaranteed to run after every
//! chained consumer finishes, regardless of how the chain terminated.
//! Stacked resources unwind in LIFO order.

use super::{OpValue, Operation, OperationState, Outcome};
use futures::future::BoxFuture;
use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex},
};

type ErasedTeardown = Box<dyn FnOnce(OperationState) -> BoxFuture<'static, ()> + Send>;
type TeardownStack = Arc<Mutex<Vec<ErasedTeardown>>>;

/// A resolved resource together with the teardowns accumulated on the way to
/// acquiring it.
pub struct Scoped<T> {
    value: T,
    stack: TeardownStack,
}

impl<T: Clone> Clone for Scoped<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            stack: Arc::clone(&self.stack),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Scoped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped").field("value", &self.value).finish()
    }
}

/// An [`Operation`] that owns one or more scoped resources.
///
/// The resource value is only handed to consumers through [`pop`], [`pend`]
/// and [`push`]; the teardown stack travels with it until a `pop` finally
/// unwinds everything.
///
/// [`pop`]: ScopedOperation::pop
/// [`pend`]: ScopedOperation::pend
/// [`push`]: ScopedOperation::push
pub struct ScopedOperation<T: OpValue> {
    inner: Operation<Scoped<T>>,
}

impl<T: OpValue> ScopedOperation<T> {
    /// Pairs `setup` with a teardown for the acquired resource.
    ///
    /// The teardown receives the resource and the terminal state of the
    /// operation chained after it, and runs only if `setup` succeeded.
    pub fn acquire<F, Fut>(setup: Operation<T>, teardown: F) -> Self
    where
        F: FnOnce(T, OperationState) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = setup.map(move |value| {
            let captured = value.clone();
            let erased: ErasedTeardown =
                Box::new(move |state| Box::pin(teardown(captured, state)));
            Scoped {
                value,
                stack: Arc::new(Mutex::new(vec![erased])),
            }
        });
        Self { inner }
    }

    /// A scoped operation over an already-available value, with no teardown.
    pub fn pure(value: T) -> Self {
        Self::from_operation(Operation::done(value))
    }

    /// Wraps an operation with an empty teardown stack.
    pub fn from_operation(setup: Operation<T>) -> Self {
        let inner = setup.map(|value| Scoped {
            value,
            stack: Arc::new(Mutex::new(Vec::new())),
        });
        Self { inner }
    }

    /// Attaches an extra teardown on top of the stack; it unwinds before any
    /// teardown registered earlier.
    pub fn on_teardown<F, Fut>(self, action: F) -> Self
    where
        F: FnOnce(OperationState) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.map(move |scoped| {
            let erased: ErasedTeardown = Box::new(move |state| Box::pin(action(state)));
            scoped
                .stack
                .lock()
                .expect("teardown stack poisoned")
                .push(erased);
            scoped
        });
        Self { inner }
    }

    /// Applies `f` to the resource and tears everything down after the
    /// resulting operation reaches a terminal state.
    ///
    /// Teardown is guaranteed for every terminal state of the chained
    /// operation, including cancellation, and unwinds the stack in LIFO
    /// order before the returned operation resolves.
    pub fn pop<U, F>(self, f: F) -> Operation<U>
    where
        U: OpValue,
        F: FnOnce(T) -> Operation<U> + Send + 'static,
    {
        self.inner.chain(move |outcome| match outcome {
            Outcome::Done(scoped) => {
                let stack = Arc::clone(&scoped.stack);
                f(scoped.value.clone()).chain(move |end| {
                    let state = end.state();
                    unwind_then(stack, state, end)
                })
            }
            Outcome::Failed(error) => Operation::failed(error),
            Outcome::Cancelled => Operation::cancelled(),
        })
    }

    /// Applies `f` to the resource, keeping the resource alive across the
    /// pended operation. If the pended operation fails or is cancelled, the
    /// stack unwinds immediately and the failure propagates.
    pub fn pend<U, F>(self, f: F) -> ScopedOperation<U>
    where
        U: OpValue,
        F: FnOnce(T) -> Operation<U> + Send + 'static,
    {
        let inner = self.inner.chain(move |outcome| match outcome {
            Outcome::Done(scoped) => {
                let stack = Arc::clone(&scoped.stack);
                f(scoped.value.clone()).chain(move |end| match end {
                    Outcome::Done(value) => Operation::done(Scoped { value, stack }),
                    Outcome::Failed(error) => unwind_then(
                        stack,
                        OperationState::Failed,
                        Outcome::Failed(error),
                    ),
                    Outcome::Cancelled => {
                        unwind_then(stack, OperationState::Cancelled, Outcome::Cancelled)
                    }
                })
            }
            Outcome::Failed(error) => Operation::failed(error),
            Outcome::Cancelled => Operation::cancelled(),
        });
        ScopedOperation { inner }
    }

    /// Stacks another scoped resource derived from this one. The pushed
    /// resource's teardown unwinds first.
    pub fn push<U, F>(self, g: F) -> ScopedOperation<U>
    where
        U: OpValue,
        F: FnOnce(T) -> ScopedOperation<U> + Send + 'static,
    {
        let inner = self.inner.chain(move |outcome| match outcome {
            Outcome::Done(scoped) => {
                let outer = Arc::clone(&scoped.stack);
                g(scoped.value.clone()).inner.chain(move |end| match end {
                    Outcome::Done(pushed) => {
                        {
                            let mut merged =
                                outer.lock().expect("teardown stack poisoned");
                            let mut inner_stack = pushed
                                .stack
                                .lock()
                                .expect("teardown stack poisoned");
                            merged.append(&mut inner_stack);
                        }
                        Operation::done(Scoped {
                            value: pushed.value,
                            stack: outer,
                        })
                    }
                    // A failed inner acquisition never built its resource, so
                    // only the outer stack unwinds here.
                    Outcome::Failed(error) => unwind_then(
                        outer,
                        OperationState::Failed,
                        Outcome::Failed(error),
                    ),
                    Outcome::Cancelled => {
                        unwind_then(outer, OperationState::Cancelled, Outcome::Cancelled)
                    }
                })
            }
            Outcome::Failed(error) => Operation::failed(error),
            Outcome::Cancelled => Operation::cancelled(),
        });
        ScopedOperation { inner }
    }
}

impl<T: OpValue> fmt::Debug for ScopedOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedOperation")
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Unwinds `stack` in LIFO order, then resolves with `result`.
///
/// The unwind itself is not cancellable; teardown actions always run to
/// completion once started.
fn unwind_then<U: OpValue>(
    stack: TeardownStack,
    state: OperationState,
    result: Outcome<U>,
) -> Operation<U> {
    let (resolver, operation) = Operation::resolver("teardown");
    tokio::spawn(async move {
        let teardowns: Vec<ErasedTeardown> = {
            let mut stack = stack.lock().expect("teardown stack poisoned");
            stack.drain(..).collect()
        };
        for teardown in teardowns.into_iter().rev() {
            teardown(state).await;
        }
        resolver.resolve_outcome(result);
    });
    operation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CompanionError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records teardown invocations as (tag, state) pairs.
    #[derive(Clone, Default)]
    struct TeardownLog {
        entries: Arc<Mutex<Vec<(&'static str, OperationState)>>>,
    }

    impl TeardownLog {
        fn record(&self, tag: &'static str, state: OperationState) {
            self.entries
                .lock()
                .unwrap()
                .push((tag, state));
        }

        fn entries(&self) -> Vec<(&'static str, OperationState)> {
            self.entries.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn pop_tears_down_after_chained_work() {
        let log = TeardownLog::default();
        let scoped = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done("resource"), move |_, state| {
                let log = log.clone();
                async move { log.record("outer", state) }
            })
        };
        let result = scoped
            .pop(|value| Operation::done(value.len()))
            .await
            .unwrap();
        assert_eq!(result, 8);
        assert_eq!(log.entries(), vec![("outer", OperationState::Done)]);
    }

    #[tokio::test]
    async fn teardown_receives_failure_state() {
        let log = TeardownLog::default();
        let scoped = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done(1), move |_, state| {
                let log = log.clone();
                async move { log.record("outer", state) }
            })
        };
        let result: Result<i32, _> = scoped
            .pop(|_| Operation::failed(CompanionError::invalid_argument("boom")))
            .await;
        assert!(result.is_err());
        assert_eq!(log.entries(), vec![("outer", OperationState::Failed)]);
    }

    #[tokio::test]
    async fn stacked_resources_unwind_lifo() {
        let log = TeardownLog::default();
        let outer = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done(1), move |_, state| {
                let log = log.clone();
                async move { log.record("outer", state) }
            })
        };
        let both = {
            let log = log.clone();
            outer.push(move |outer_value| {
                ScopedOperation::acquire(
                    Operation::done(outer_value + 1),
                    move |_, state| {
                        let log = log.clone();
                        async move { log.record("inner", state) }
                    },
                )
            })
        };
        let result = both.pop(|v| Operation::done(v)).await.unwrap();
        assert_eq!(result, 2);
        assert_eq!(
            log.entries(),
            vec![
                ("inner", OperationState::Done),
                ("outer", OperationState::Done)
            ]
        );
    }

    #[tokio::test]
    async fn pend_keeps_resource_alive() {
        let torn_down = Arc::new(AtomicUsize::new(0));
        let scoped = {
            let counter = torn_down.clone();
            ScopedOperation::acquire(Operation::done(10), move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let counter = torn_down.clone();
        let pended = scoped.pend(move |v| {
            // The resource must not have been torn down while pending.
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            Operation::done(v * 2)
        });
        let result = pended.pop(|v| Operation::done(v + 1)).await.unwrap();
        assert_eq!(result, 21);
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pend_failure_unwinds_immediately() {
        let log = TeardownLog::default();
        let scoped = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done(1), move |_, state| {
                let log = log.clone();
                async move { log.record("outer", state) }
            })
        };
        let pended: ScopedOperation<i32> = scoped.pend(|_| {
            Operation::failed(CompanionError::invalid_argument("setup step failed"))
        });
        let result = pended.pop(|v| Operation::done(v)).await;
        assert!(result.is_err());
        assert_eq!(log.entries(), vec![("outer", OperationState::Failed)]);
    }

    #[tokio::test]
    async fn on_teardown_unwinds_before_acquire_teardown() {
        let log = TeardownLog::default();
        let scoped = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done(1), move |_, state| {
                let log = log.clone();
                async move { log.record("acquire", state) }
            })
        };
        let scoped = {
            let log = log.clone();
            scoped.on_teardown(move |state| {
                let log = log.clone();
                async move { log.record("extra", state) }
            })
        };
        scoped.pop(|v| Operation::done(v)).await.unwrap();
        assert_eq!(
            log.entries(),
            vec![
                ("extra", OperationState::Done),
                ("acquire", OperationState::Done)
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_chain_still_tears_down() {
        let log = TeardownLog::default();
        let scoped = {
            let log = log.clone();
            ScopedOperation::acquire(Operation::done(1), move |_, state| {
                let log = log.clone();
                async move { log.record("outer", state) }
            })
        };
        let popped = scoped.pop(|_| Operation::<i32>::cancelled());
        let result = popped.await;
        assert!(matches!(result, Err(CompanionError::Cancelled)));
        assert_eq!(log.entries(), vec![("outer", OperationState::Cancelled)]);
    }
}
