// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The async primitive underlying every companion operation.
//!
//! An [`Operation`] is a handle to one pending result. It differs from a bare
//! [`std::future::Future`] in three ways that the control plane depends on:
//!
//! * its state is observable (`running`/`done`/`failed`/`cancelled`) and can
//!   be awaited by any number of handles;
//! * cancellation is a first-class request: responders registered with
//!   [`Operation::on_cancel`] run before the operation transitions to
//!   `cancelled`, and [`Operation::cancel`] resolves only when they have all
//!   completed;
//! * derived operations ([`Operation::map`], [`Operation::chain`], …)
//!   propagate cancellation upstream unless explicitly shielded.
//!
//! The scoped variant, [`ScopedOperation`], pairs an acquired resource with a
//! teardown that is guaranteed to run after every chained consumer finishes,
//! in LIFO order across stacked resources.
//!
//! All constructors that drive work (`spawn`, combinators, [`SerialQueue`])
//! must be called from within a tokio runtime.

mod queue;
mod scoped;

pub use queue::SerialQueue;
pub use scoped::{Scoped, ScopedOperation};

use crate::errors::{CompanionError, CompanionResult};
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use smol_str::SmolStr;
use std::{
    fmt,
    future::{Future, IntoFuture},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::Instrument;

/// Values an [`Operation`] can carry.
///
/// The result of an operation is fanned out to every waiting handle, so the
/// value must be cheaply cloneable; in practice values are paths, descriptors,
/// small structs or `()`.
pub trait OpValue: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> OpValue for T {}

/// The observable state of an operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationState {
    /// The operation has not resolved yet.
    Running,
    /// The operation resolved successfully.
    Done,
    /// The operation resolved in error.
    Failed,
    /// The operation was cancelled.
    Cancelled,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationState::Running => "running",
            OperationState::Done => "done",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The terminal snapshot of an operation.
#[derive(Clone, Debug)]
pub enum Outcome<T> {
    /// Resolved successfully with a value.
    Done(T),
    /// Resolved in error.
    Failed(CompanionError),
    /// Cancellation completed.
    Cancelled,
}

impl<T> Outcome<T> {
    /// The state this outcome corresponds to.
    pub fn state(&self) -> OperationState {
        match self {
            Outcome::Done(_) => OperationState::Done,
            Outcome::Failed(_) => OperationState::Failed,
            Outcome::Cancelled => OperationState::Cancelled,
        }
    }

    /// Converts the outcome into a result, mapping cancellation onto
    /// [`CompanionError::Cancelled`].
    pub fn into_result(self) -> CompanionResult<T> {
        match self {
            Outcome::Done(value) => Ok(value),
            Outcome::Failed(error) => Err(error),
            Outcome::Cancelled => Err(CompanionError::Cancelled),
        }
    }
}

type CancelResponder = Box<dyn FnOnce() -> Operation<()> + Send>;

enum CancelState {
    Idle,
    Requested { done: Operation<()> },
}

struct RunningState<T> {
    waiters: Vec<oneshot::Sender<()>>,
    cancel_waiters: Vec<oneshot::Sender<()>>,
    responders: Vec<CancelResponder>,
    cancel: CancelState,
    _marker: std::marker::PhantomData<T>,
}

impl<T> RunningState<T> {
    fn new() -> Self {
        Self {
            waiters: Vec::new(),
            cancel_waiters: Vec::new(),
            responders: Vec::new(),
            cancel: CancelState::Idle,
            _marker: std::marker::PhantomData,
        }
    }
}

enum Slot<T> {
    Running(RunningState<T>),
    Terminal(Outcome<T>),
}

struct Inner<T> {
    name: Mutex<SmolStr>,
    slot: Mutex<Slot<T>>,
}

impl<T: OpValue> Inner<T> {
    /// Performs the single terminal transition. Returns false if the slot was
    /// already terminal.
    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let waiters = {
            let mut slot = self.slot.lock().expect("operation slot poisoned");
            match &mut *slot {
                Slot::Terminal(_) => return false,
                Slot::Running(state) => {
                    let waiters = std::mem::take(&mut state.waiters);
                    // Dropping cancel_waiters wakes any cancellation listener,
                    // which re-checks the slot and parks forever on a
                    // non-cancelled terminal.
                    *slot = Slot::Terminal(outcome);
                    waiters
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        true
    }
}

/// A handle to one pending computation result.
///
/// Handles are cheap to clone; all clones observe the same resolution.
pub struct Operation<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: OpValue> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl<T: OpValue> Operation<T> {
    fn with_slot(name: impl Into<SmolStr>, slot: Slot<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: Mutex::new(name.into()),
                slot: Mutex::new(slot),
            }),
        }
    }

    /// An operation that has already resolved successfully.
    pub fn done(value: T) -> Self {
        Self::with_slot("done", Slot::Terminal(Outcome::Done(value)))
    }

    /// An operation that has already resolved in error.
    pub fn failed(error: CompanionError) -> Self {
        Self::with_slot("failed", Slot::Terminal(Outcome::Failed(error)))
    }

    /// An operation that has already been cancelled.
    pub fn cancelled() -> Self {
        Self::with_slot("cancelled", Slot::Terminal(Outcome::Cancelled))
    }

    /// An operation resolved from a result.
    pub fn from_result(result: CompanionResult<T>) -> Self {
        match result {
            Ok(value) => Self::done(value),
            Err(error) => Self::failed(error),
        }
    }

    /// Creates an unresolved operation together with its [`Resolver`].
    ///
    /// External code resolves the operation through the resolver; dropping
    /// the resolver without resolving fails the operation.
    pub fn resolver(name: impl Into<SmolStr>) -> (Resolver<T>, Operation<T>) {
        let operation = Self::with_slot(name, Slot::Running(RunningState::<T>::new()));
        let resolver = Resolver {
            inner: Arc::clone(&operation.inner),
            armed: true,
        };
        (resolver, operation)
    }

    /// Spawns `producer` on the tokio runtime and resolves the operation with
    /// its result.
    ///
    /// Requesting cancellation stops the producer at its next suspension
    /// point; registered cancel responders then run before the operation
    /// transitions to `cancelled`.
    pub fn spawn<F>(name: impl Into<SmolStr>, producer: F) -> Self
    where
        F: Future<Output = CompanionResult<T>> + Send + 'static,
    {
        let (resolver, operation) = Self::resolver(name);
        let signal = operation.clone();
        let span = tracing::debug_span!("operation", name = %signal.name());
        let driver = async move {
            tokio::select! {
                biased;
                _ = signal.cancellation_requested() => resolver.disarm(),
                result = producer => resolver.resolve_result(result),
            }
        };
        tokio::spawn(driver.instrument(span));
        operation
    }

    /// Spawns `producer` without the cancellation short-circuit.
    ///
    /// A cancel request still runs responders and can resolve the operation
    /// as cancelled, but the producer always runs to completion; it is
    /// expected to observe cancellation through its own channels and wind
    /// down. Used where teardown or event flushing must not be abandoned
    /// mid-flight.
    pub fn spawn_uninterruptible<F>(name: impl Into<SmolStr>, producer: F) -> Self
    where
        F: Future<Output = CompanionResult<T>> + Send + 'static,
    {
        let (resolver, operation) = Self::resolver(name);
        let span = tracing::debug_span!("operation", name = %operation.name());
        let driver = async move {
            resolver.resolve_result(producer.await);
        };
        tokio::spawn(driver.instrument(span));
        operation
    }

    /// Runs operations produced by `attempt` until one succeeds, retrying a
    /// failure up to `attempts` times with `backoff` between tries.
    ///
    /// Cancellation of an attempt is not retried.
    pub fn retry<F>(
        name: impl Into<SmolStr>,
        attempts: usize,
        backoff: Duration,
        mut attempt: F,
    ) -> Operation<T>
    where
        F: FnMut() -> Operation<T> + Send + 'static,
    {
        Operation::spawn(name, async move {
            let mut remaining = attempts.max(1);
            loop {
                match attempt().awaited().await {
                    Outcome::Done(value) => return Ok(value),
                    Outcome::Cancelled => return Err(CompanionError::Cancelled),
                    Outcome::Failed(error) => {
                        remaining -= 1;
                        if remaining == 0 {
                            return Err(error);
                        }
                        tracing::debug!(%error, remaining, "retrying after failure");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        })
    }

    /// The operation's name, for logging.
    pub fn name(&self) -> SmolStr {
        self.inner.name.lock().expect("operation name poisoned").clone()
    }

    /// Renames the operation and returns it, for chaining.
    pub fn named(self, name: impl Into<SmolStr>) -> Self {
        *self.inner.name.lock().expect("operation name poisoned") = name.into();
        self
    }

    /// The current state of the operation.
    pub fn state(&self) -> OperationState {
        let slot = self.inner.slot.lock().expect("operation slot poisoned");
        match &*slot {
            Slot::Running(_) => OperationState::Running,
            Slot::Terminal(outcome) => outcome.state(),
        }
    }

    /// The terminal outcome, if the operation has resolved.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        let slot = self.inner.slot.lock().expect("operation slot poisoned");
        match &*slot {
            Slot::Running(_) => None,
            Slot::Terminal(outcome) => Some(outcome.clone()),
        }
    }

    /// Waits for the operation to reach a terminal state.
    pub async fn awaited(&self) -> Outcome<T> {
        loop {
            let rx = {
                let mut slot = self.inner.slot.lock().expect("operation slot poisoned");
                match &mut *slot {
                    Slot::Terminal(outcome) => return outcome.clone(),
                    Slot::Running(state) => {
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push(tx);
                        rx
                    }
                }
            };
            // A send error means the sender was dropped during resolution;
            // loop around and read the terminal slot.
            let _ = rx.await;
        }
    }

    /// Resolves when cancellation of this operation has been requested.
    ///
    /// Never resolves if the operation reaches a non-cancelled terminal
    /// state; callers always race this against the work itself.
    pub(crate) async fn cancellation_requested(&self) {
        loop {
            let rx = {
                let mut slot = self.inner.slot.lock().expect("operation slot poisoned");
                match &mut *slot {
                    Slot::Terminal(Outcome::Cancelled) => return,
                    Slot::Terminal(_) => None,
                    Slot::Running(state) => {
                        if matches!(state.cancel, CancelState::Requested { .. }) {
                            return;
                        }
                        let (tx, rx) = oneshot::channel();
                        state.cancel_waiters.push(tx);
                        Some(rx)
                    }
                }
            };
            match rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => futures::future::pending::<()>().await,
            }
        }
    }

    /// Registers a cancellation responder.
    ///
    /// If the operation is cancelled, the responder runs before the terminal
    /// transition and [`cancel`](Self::cancel) waits for the operation it
    /// returns. If cancellation was already requested the responder runs
    /// immediately.
    pub fn on_cancel<F>(&self, responder: F)
    where
        F: FnOnce() -> Operation<()> + Send + 'static,
    {
        let run_now = {
            let mut slot = self.inner.slot.lock().expect("operation slot poisoned");
            match &mut *slot {
                Slot::Running(state) => match state.cancel {
                    CancelState::Idle => {
                        state.responders.push(Box::new(responder));
                        None
                    }
                    CancelState::Requested { .. } => Some(responder),
                },
                Slot::Terminal(Outcome::Cancelled) => Some(responder),
                Slot::Terminal(_) => None,
            }
        };
        if let Some(responder) = run_now {
            let _ = responder();
        }
    }

    /// Requests cancellation.
    ///
    /// Returns an operation that resolves once every registered responder has
    /// resolved. Cancelling an already-terminal operation is a no-op that
    /// returns an already-completed operation.
    pub fn cancel(&self) -> Operation<()> {
        let (responders, resolver, done) = {
            let mut slot = self.inner.slot.lock().expect("operation slot poisoned");
            match &mut *slot {
                Slot::Terminal(_) => return Operation::done(()),
                Slot::Running(state) => match &state.cancel {
                    CancelState::Requested { done } => return done.clone(),
                    CancelState::Idle => {
                        let responders = std::mem::take(&mut state.responders);
                        let cancel_waiters = std::mem::take(&mut state.cancel_waiters);
                        let (resolver, done) = Operation::resolver("cancel");
                        state.cancel = CancelState::Requested { done: done.clone() };
                        for waiter in cancel_waiters {
                            let _ = waiter.send(());
                        }
                        (responders, resolver, done)
                    }
                },
            }
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Responders are started in registration order and awaited
            // sequentially so dependent cleanups cannot overlap.
            for responder in responders {
                let _ = responder().awaited().await;
            }
            inner.resolve(Outcome::Cancelled);
            resolver.resolve(());
        });
        done
    }

    /// Invokes `handler` with the terminal outcome, exactly once, regardless
    /// of when it is registered relative to resolution.
    pub fn on_complete<F>(&self, handler: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let operation = self.clone();
        tokio::spawn(async move {
            let outcome = operation.awaited().await;
            handler(outcome);
        });
    }

    /// The universal derivation operator: applies `f` to the terminal
    /// outcome, whatever it is, and resolves with the operation `f` returns.
    ///
    /// Cancelling the derived operation propagates to the receiver (and to
    /// the operation returned by `f`, once it exists).
    pub fn chain<U, F>(&self, f: F) -> Operation<U>
    where
        U: OpValue,
        F: FnOnce(Outcome<T>) -> Operation<U> + Send + 'static,
    {
        let source = self.clone();
        let (resolver, derived) = Operation::resolver(self.name());
        {
            let upstream = source.clone();
            derived.on_cancel(move || upstream.cancel());
        }
        let signal = derived.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = signal.cancellation_requested() => {
                    resolver.disarm();
                    return;
                }
                outcome = source.awaited() => outcome,
            };
            let next = f(outcome);
            {
                let next = next.clone();
                signal.on_cancel(move || next.cancel());
            }
            tokio::select! {
                biased;
                _ = signal.cancellation_requested() => resolver.disarm(),
                end = next.awaited() => resolver.resolve_outcome(end),
            }
        });
        derived
    }

    /// Maps a successful value; failures and cancellation pass through.
    pub fn map<U, F>(&self, f: F) -> Operation<U>
    where
        U: OpValue,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(|outcome| match outcome {
            Outcome::Done(value) => Operation::done(f(value)),
            Outcome::Failed(error) => Operation::failed(error),
            Outcome::Cancelled => Operation::cancelled(),
        })
    }

    /// Chains a successful value into another operation; failures and
    /// cancellation pass through.
    pub fn and_then<U, F>(&self, f: F) -> Operation<U>
    where
        U: OpValue,
        F: FnOnce(T) -> Operation<U> + Send + 'static,
    {
        self.chain(|outcome| match outcome {
            Outcome::Done(value) => f(value),
            Outcome::Failed(error) => Operation::failed(error),
            Outcome::Cancelled => Operation::cancelled(),
        })
    }

    /// Recovers from a failure by chaining into another operation.
    pub fn recover<F>(&self, f: F) -> Operation<T>
    where
        F: FnOnce(CompanionError) -> Operation<T> + Send + 'static,
    {
        self.chain(|outcome| match outcome {
            Outcome::Done(value) => Operation::done(value),
            Outcome::Failed(error) => f(error),
            Outcome::Cancelled => Operation::cancelled(),
        })
    }

    /// Replaces a failure with a fixed value.
    pub fn fallback(&self, value: T) -> Operation<T> {
        self.recover(move |_| Operation::done(value))
    }

    /// Replaces a successful value with a fixed one.
    pub fn map_replace<U: OpValue>(&self, value: U) -> Operation<U> {
        self.map(move |_| value)
    }

    /// Replaces a successful value by chaining into a fixed operation.
    pub fn and_then_replace<U: OpValue>(&self, operation: Operation<U>) -> Operation<U> {
        self.and_then(move |_| operation)
    }

    /// Delays delivery of the terminal outcome.
    pub fn delayed(&self, delay: Duration) -> Operation<T> {
        self.chain(move |outcome| {
            Operation::spawn("delay", async move {
                tokio::time::sleep(delay).await;
                outcome.into_result()
            })
        })
    }

    /// Fails with [`CompanionError::Timeout`] if the receiver is unresolved
    /// after `after`, cancelling the receiver on the timer branch.
    pub fn with_timeout(&self, after: Duration, reason: impl Into<String>) -> Operation<T> {
        let source = self.clone();
        let reason = reason.into();
        let (resolver, derived) = Operation::resolver(self.name());
        {
            let upstream = source.clone();
            derived.on_cancel(move || upstream.cancel());
        }
        let signal = derived.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = signal.cancellation_requested() => resolver.disarm(),
                outcome = source.awaited() => resolver.resolve_outcome(outcome),
                _ = tokio::time::sleep(after) => {
                    let _ = source.cancel();
                    resolver.fail(CompanionError::Timeout { after, reason });
                }
            }
        });
        derived
    }

    /// Rewords the message of a failure while keeping its taxonomy kind.
    pub fn rephrase_failure(&self, context: impl Into<String>) -> Operation<T> {
        let context = context.into();
        self.chain(move |outcome| match outcome {
            Outcome::Failed(error) => Operation::failed(rephrase(context, error)),
            other => Operation::with_slot("rephrased", Slot::Terminal(other)),
        })
    }

    /// Stops upstream cancellation propagation: cancelling the returned
    /// operation does not cancel the receiver.
    pub fn shield_cancellation(&self) -> Operation<T> {
        let source = self.clone();
        let (resolver, derived) = Operation::resolver(self.name());
        let signal = derived.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = signal.cancellation_requested() => resolver.disarm(),
                outcome = source.awaited() => resolver.resolve_outcome(outcome),
            }
        });
        derived
    }

    /// Resolves when every member resolves, with values in member order.
    ///
    /// On the first failure the aggregate fails with that error and every
    /// still-running member is cancelled; likewise for a member cancellation.
    pub fn all(operations: Vec<Operation<T>>) -> Operation<Vec<T>> {
        let (resolver, aggregate) = Operation::<Vec<T>>::resolver("all");
        for member in &operations {
            let member = member.clone();
            aggregate.on_cancel(move || member.cancel());
        }
        let signal = aggregate.clone();
        tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = operations
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, op)| async move { (index, op.awaited().await) })
                .collect();
            let mut values: Vec<Option<T>> = vec![None; operations.len()];
            loop {
                let next = tokio::select! {
                    biased;
                    _ = signal.cancellation_requested() => {
                        resolver.disarm();
                        return;
                    }
                    next = pending.next() => next,
                };
                match next {
                    None => {
                        let values = values.into_iter().map(|v| {
                            v.expect("every member resolved before aggregate completion")
                        });
                        resolver.resolve(values.collect());
                        return;
                    }
                    Some((index, Outcome::Done(value))) => values[index] = Some(value),
                    Some((_, Outcome::Failed(error))) => {
                        cancel_all(&operations);
                        resolver.fail(error);
                        return;
                    }
                    Some((_, Outcome::Cancelled)) => {
                        cancel_all(&operations);
                        resolver.resolve_outcome(Outcome::Cancelled);
                        return;
                    }
                }
            }
        });
        aggregate
    }

    /// Resolves with the first member to reach a terminal state; every other
    /// member receives a cancellation request.
    pub fn race(operations: Vec<Operation<T>>) -> Operation<T> {
        let (resolver, aggregate) = Operation::resolver("race");
        for member in &operations {
            let member = member.clone();
            aggregate.on_cancel(move || member.cancel());
        }
        let signal = aggregate.clone();
        tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = operations
                .iter()
                .cloned()
                .map(|op| async move { op.awaited().await })
                .collect();
            let first = tokio::select! {
                biased;
                _ = signal.cancellation_requested() => {
                    resolver.disarm();
                    return;
                }
                first = pending.next() => first,
            };
            cancel_all(&operations);
            match first {
                Some(outcome) => resolver.resolve_outcome(outcome),
                None => resolver.fail(CompanionError::invalid_argument(
                    "race requires at least one operation",
                )),
            }
        });
        aggregate
    }
}

impl Operation<()> {
    /// Polls `predicate` on an interval until it returns true.
    pub fn resolve_when<F>(
        name: impl Into<SmolStr>,
        poll_interval: Duration,
        mut predicate: F,
    ) -> Operation<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Operation::spawn(name, async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                if predicate() {
                    return Ok(());
                }
            }
        })
    }
}

fn cancel_all<T: OpValue>(operations: &[Operation<T>]) {
    for operation in operations {
        let _ = operation.cancel();
    }
}

fn rephrase(context: String, error: CompanionError) -> CompanionError {
    match error {
        CompanionError::InvalidArgument(m) => {
            CompanionError::InvalidArgument(format!("{context}: {m}"))
        }
        CompanionError::NotFound(m) => CompanionError::NotFound(format!("{context}: {m}")),
        CompanionError::AlreadyExists(m) => {
            CompanionError::AlreadyExists(format!("{context}: {m}"))
        }
        CompanionError::Protocol(m) => CompanionError::Protocol(format!("{context}: {m}")),
        CompanionError::Internal(m) => CompanionError::Internal(format!("{context}: {m}")),
        CompanionError::Io { context: c, source } => CompanionError::Io {
            context: format!("{context}: {c}"),
            source,
        },
        CompanionError::Subprocess {
            command,
            description,
        } => CompanionError::Subprocess {
            command,
            description: format!("{context}: {description}"),
        },
        other => other,
    }
}

impl<T: OpValue> IntoFuture for Operation<T> {
    type Output = CompanionResult<T>;
    type IntoFuture = BoxFuture<'static, CompanionResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.awaited().await.into_result() })
    }
}

/// The writing end of an externally-resolved operation.
///
/// Dropping an armed resolver fails its operation, unless cancellation is in
/// flight, in which case the cancel path owns the terminal transition.
pub struct Resolver<T: OpValue> {
    inner: Arc<Inner<T>>,
    armed: bool,
}

impl<T: OpValue> Resolver<T> {
    /// Resolves the operation successfully.
    pub fn resolve(mut self, value: T) {
        self.armed = false;
        self.inner.resolve(Outcome::Done(value));
    }

    /// Fails the operation.
    pub fn fail(mut self, error: CompanionError) {
        self.armed = false;
        self.inner.resolve(Outcome::Failed(error));
    }

    /// Resolves the operation with a result.
    pub fn resolve_result(self, result: CompanionResult<T>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(error) => self.fail(error),
        }
    }

    /// Resolves the operation with a terminal outcome.
    pub fn resolve_outcome(mut self, outcome: Outcome<T>) {
        self.armed = false;
        self.inner.resolve(outcome);
    }

    /// True if cancellation of the operation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        let slot = self.inner.slot.lock().expect("operation slot poisoned");
        match &*slot {
            Slot::Running(state) => matches!(state.cancel, CancelState::Requested { .. }),
            Slot::Terminal(outcome) => outcome.state() == OperationState::Cancelled,
        }
    }

    /// Disarms the resolver without resolving; used on the cancellation path,
    /// which performs the terminal transition itself.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: OpValue> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // If cancellation is in flight the cancel task transitions the slot;
        // failing here would race it.
        if self.is_cancel_requested() {
            return;
        }
        self.inner.resolve(Outcome::Failed(CompanionError::Internal(
            "operation abandoned before resolution".to_owned(),
        )));
    }
}

impl<T: OpValue> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("armed", &self.armed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_error() -> CompanionError {
        CompanionError::invalid_argument("test failure")
    }

    #[tokio::test]
    async fn immediate_values_resolve() {
        let op = Operation::done(7);
        assert_eq!(op.state(), OperationState::Done);
        assert_eq!(op.await.unwrap(), 7);

        let op: Operation<i32> = Operation::failed(test_error());
        assert_eq!(op.state(), OperationState::Failed);
        assert!(op.await.is_err());
    }

    #[tokio::test]
    async fn terminal_transition_happens_once() {
        let (resolver, op) = Operation::resolver("once");
        resolver.resolve(1);
        // A later cancel is a no-op against the terminal state.
        op.cancel().await.unwrap();
        assert_eq!(op.state(), OperationState::Done);
        assert_eq!(op.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn on_complete_fires_exactly_once_for_late_subscribers() {
        let (resolver, op) = Operation::resolver("late");
        resolver.resolve(5);
        let count = Arc::new(AtomicUsize::new(0));
        let observed = {
            let count = count.clone();
            let (tx, rx) = oneshot::channel();
            op.on_complete(move |outcome| {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome.state());
            });
            rx
        };
        assert_eq!(observed.await.unwrap(), OperationState::Done);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn map_applies_on_success_only() {
        let mapped = Operation::done(2).map(|v| v * 10);
        assert_eq!(mapped.await.unwrap(), 20);

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let mapped = Operation::<i32>::failed(test_error()).map(move |v| {
            flag.store(true, Ordering::SeqCst);
            v
        });
        assert!(mapped.await.is_err());
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn chain_sees_every_terminal() {
        let chained = Operation::<i32>::cancelled().chain(|outcome| {
            Operation::done(matches!(outcome, Outcome::Cancelled))
        });
        assert!(chained.await.unwrap());
    }

    #[tokio::test]
    async fn recover_and_fallback() {
        let recovered =
            Operation::<i32>::failed(test_error()).recover(|_| Operation::done(42));
        assert_eq!(recovered.await.unwrap(), 42);

        let fallen = Operation::<i32>::failed(test_error()).fallback(9);
        assert_eq!(fallen.await.unwrap(), 9);

        // Success passes through untouched.
        let untouched = Operation::done(1).fallback(9);
        assert_eq!(untouched.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn all_collects_in_order() {
        let (resolver_a, a) = Operation::resolver("a");
        let b = Operation::done(2);
        let aggregate = Operation::all(vec![a, b]);
        // Resolve the slower member after the faster one.
        resolver_a.resolve(1);
        assert_eq!(aggregate.await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn all_fails_fast_and_cancels_remainder() {
        let (_resolver, slow) = Operation::<i32>::resolver("slow");
        let failing = Operation::<i32>::failed(test_error());
        let slow_handle = slow.clone();
        let aggregate = Operation::all(vec![slow, failing]);
        assert!(aggregate.await.is_err());

        // The still-running member received a cancellation request.
        slow_handle.cancellation_requested().await;
    }

    #[tokio::test]
    async fn race_resolves_with_first_and_cancels_rest() {
        let (_resolver, slow) = Operation::<i32>::resolver("slow");
        let fast = Operation::done(3);
        let slow_handle = slow.clone();
        let winner = Operation::race(vec![slow, fast]);
        assert_eq!(winner.await.unwrap(), 3);
        slow_handle.cancellation_requested().await;
    }

    #[tokio::test]
    async fn timeout_cancels_receiver_when_timer_fires() {
        let (_resolver, never) = Operation::<i32>::resolver("never");
        let handle = never.clone();
        let timed = never.with_timeout(Duration::from_millis(20), "test deadline");
        let error = timed.await.unwrap_err();
        assert!(matches!(error, CompanionError::Timeout { .. }), "{error}");
        handle.cancellation_requested().await;
    }

    #[tokio::test]
    async fn timeout_passes_through_fast_resolution() {
        let timed = Operation::done(4).with_timeout(Duration::from_secs(5), "never hit");
        assert_eq!(timed.await.unwrap(), 4);
    }

    #[tokio::test]
    async fn cancel_runs_responders_before_terminal_state() {
        let (_resolver, op) = Operation::<i32>::resolver("with-cleanup");
        let cleaned = Arc::new(AtomicBool::new(false));
        {
            let cleaned = cleaned.clone();
            op.on_cancel(move || {
                Operation::spawn("cleanup", async move {
                    cleaned.store(true, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        op.cancel().await.unwrap();
        assert!(cleaned.load(Ordering::SeqCst));
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[tokio::test]
    async fn derived_cancellation_propagates_upstream() {
        let (_resolver, source) = Operation::<i32>::resolver("source");
        let upstream = source.clone();
        let derived = source.map(|v| v + 1);
        derived.cancel().await.unwrap();
        upstream.cancellation_requested().await;
    }

    #[tokio::test]
    async fn shield_stops_upstream_propagation() {
        let (resolver, source) = Operation::<i32>::resolver("source");
        let upstream = source.clone();
        let shielded = source.shield_cancellation();
        shielded.cancel().await.unwrap();
        // The source is still running and can resolve normally.
        assert_eq!(upstream.state(), OperationState::Running);
        resolver.resolve(11);
        assert_eq!(upstream.await.unwrap(), 11);
    }

    #[tokio::test]
    async fn dropped_resolver_fails_operation() {
        let (resolver, op) = Operation::<i32>::resolver("abandoned");
        drop(resolver);
        let error = op.await.unwrap_err();
        assert!(matches!(error, CompanionError::Internal(_)), "{error}");
    }

    #[tokio::test]
    async fn spawn_stops_producer_on_cancel() {
        let reached_end = Arc::new(AtomicBool::new(false));
        let flag = reached_end.clone();
        let op = Operation::spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        op.cancel().await.unwrap();
        assert_eq!(op.state(), OperationState::Cancelled);
        assert!(!reached_end.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rephrase_keeps_taxonomy_kind() {
        let op: Operation<i32> = Operation::failed(CompanionError::NotFound("bundle".into()));
        let error = op.rephrase_failure("while installing").await.unwrap_err();
        assert_eq!(error.kind(), companion_metadata::ErrorKind::NotFound);
        assert_eq!(error.to_string(), "not found: while installing: bundle");
    }
}
