// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events for the test reporter.
//!
//! These types form the interface between the test orchestrator and reporter
//! sinks. Events are delivered strictly in order; every stream opens with
//! [`TestEventKind::DidBeginExecutingTestPlan`] and closes with exactly one
//! [`TestEventKind::DidFinishExecutingTestPlan`].

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Local};
use companion_metadata::{SuiteTotals, TestCaseStatus};
use std::sync::{Arc, Mutex};

/// A reporter event.
#[derive(Clone, Debug)]
pub struct TestEvent {
    /// When the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The kind of event this is.
    pub kind: TestEventKind,
}

impl TestEvent {
    /// Stamps `kind` with the current time.
    pub fn now(kind: TestEventKind) -> Self {
        Self {
            timestamp: Local::now().fixed_offset(),
            kind,
        }
    }
}

/// A named activity within a test case.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActivityInfo {
    /// The activity title.
    pub title: String,
}

/// A failure site within a test case.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionInfo {
    /// The failure message.
    pub message: String,
    /// The source file the failure was reported from.
    pub file: Option<String>,
    /// The source line the failure was reported from.
    pub line: Option<u64>,
}

/// The kind of test event this is. Forms part of [`TestEvent`].
#[derive(Clone, Debug)]
pub enum TestEventKind {
    /// The run has started; emitted exactly once, before anything else.
    DidBeginExecutingTestPlan,

    /// A test suite started. Suites may nest.
    SuiteDidStart {
        /// The suite name.
        suite: String,
    },

    /// A test case started.
    CaseDidStart {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
    },

    /// A test case began an activity. Only emitted when the run requested
    /// activity reporting.
    CaseWillStartActivity {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The activity.
        activity: ActivityInfo,
    },

    /// A test case finished an activity.
    CaseDidFinishActivity {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The activity.
        activity: ActivityInfo,
    },

    /// An attachment captured during an activity. Only emitted when the run
    /// requested attachment reporting.
    CaseAttachment {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The title of the activity that produced the attachment.
        activity: String,
        /// The attachment payload.
        data: Bytes,
        /// The attachment's uniform type identifier.
        uniform_type: String,
    },

    /// A test case reported one or more failures.
    CaseDidFail {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The reported failure sites.
        exceptions: Vec<ExceptionInfo>,
    },

    /// A test case finished.
    CaseDidFinish {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// How the case ended.
        status: TestCaseStatus,
        /// Wall-clock duration of the case, in seconds.
        duration: f64,
        /// Collected os_log lines, when log collection was requested.
        logs: Vec<String>,
    },

    /// A test suite finished.
    SuiteDidFinish {
        /// The suite name.
        suite: String,
        /// The suite's totals.
        totals: SuiteTotals,
    },

    /// Raw output from the test process, out of band.
    HadOutput {
        /// The output bytes.
        output: Bytes,
    },

    /// The run crashed mid-execution, out of band.
    DidCrashDuringTest {
        /// A description of the crash.
        error: String,
    },

    /// The run is over; emitted exactly once, after everything else.
    DidFinishExecutingTestPlan,
}

/// A consumer of the test-event stream.
pub trait TestReporter: Send + Sync {
    /// Delivers one event. Events arrive in order from a single driver.
    fn report(&self, event: TestEvent);
}

/// Fans one event stream out to several reporters, preserving order.
pub struct ReporterFanout {
    sinks: Vec<Arc<dyn TestReporter>>,
}

impl ReporterFanout {
    /// Creates a fanout over the given sinks.
    pub fn new(sinks: Vec<Arc<dyn TestReporter>>) -> Self {
        Self { sinks }
    }
}

impl TestReporter for ReporterFanout {
    fn report(&self, event: TestEvent) {
        for sink in &self.sinks {
            sink.report(event.clone());
        }
    }
}

/// A reporter that buffers every event; used by tests and by the boundary's
/// replay path.
#[derive(Clone, Default)]
pub struct CollectingReporter {
    events: Arc<Mutex<Vec<TestEvent>>>,
}

impl CollectingReporter {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the events received so far.
    pub fn events(&self) -> Vec<TestEvent> {
        self.events.lock().expect("reporter lock poisoned").clone()
    }

    /// The kinds received so far, for compact assertions.
    pub fn kinds(&self) -> Vec<TestEventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl TestReporter for CollectingReporter {
    fn report(&self, event: TestEvent) {
        self.events.lock().expect("reporter lock poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_preserves_order_across_sinks() {
        let first = CollectingReporter::new();
        let second = CollectingReporter::new();
        let fanout = ReporterFanout::new(vec![
            Arc::new(first.clone()),
            Arc::new(second.clone()),
        ]);

        fanout.report(TestEvent::now(TestEventKind::DidBeginExecutingTestPlan));
        fanout.report(TestEvent::now(TestEventKind::SuiteDidStart {
            suite: "SuiteA".to_owned(),
        }));
        fanout.report(TestEvent::now(TestEventKind::DidFinishExecutingTestPlan));

        for reporter in [first, second] {
            let kinds = reporter.kinds();
            assert_eq!(kinds.len(), 3);
            assert!(matches!(kinds[0], TestEventKind::DidBeginExecutingTestPlan));
            assert!(matches!(kinds[2], TestEventKind::DidFinishExecutingTestPlan));
        }
    }
}
