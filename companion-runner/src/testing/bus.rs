// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The message bus between the companion and the in-target test runner.
//!
//! The transport is the runner process's standard streams: host→runner
//! commands go down stdin, runner→host lifecycle messages come up stdout,
//! both as JSON lines. Lines that are not JSON objects are treated as raw
//! test output and passed through out-of-band; a line that looks like a
//! message but fails to decode is a protocol error.

use crate::errors::{CompanionError, CompanionResult};
use bytes::Bytes;
use companion_metadata::TestCaseStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A command sent from the companion to the runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum RunnerCommand {
    /// Begin executing the (already-negotiated) test plan.
    BeginExecution,
    /// Stop executing and exit.
    Terminate,
}

impl RunnerCommand {
    /// The command as a JSON line, newline-terminated.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).expect("commands always serialize");
        line.push(b'\n');
        line
    }
}

/// A lifecycle message sent from the runner to the companion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum RunnerMessage {
    /// The runner is about to execute the test plan.
    PlanStarted,
    /// A suite started.
    SuiteStarted {
        /// The suite name.
        suite: String,
    },
    /// A test case started.
    CaseStarted {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
    },
    /// An activity began within the current case.
    ActivityStarted {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The activity title.
        title: String,
    },
    /// An activity finished within the current case.
    ActivityFinished {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The activity title.
        title: String,
    },
    /// An attachment was captured during an activity.
    Attachment {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The title of the producing activity.
        activity: String,
        /// The attachment's uniform type identifier.
        uniform_type: String,
        /// The payload bytes.
        payload: Vec<u8>,
    },
    /// A test case reported a failure site.
    CaseFailed {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// The failure message.
        message: String,
        /// The reporting source file.
        #[serde(default)]
        file: Option<String>,
        /// The reporting source line.
        #[serde(default)]
        line: Option<u64>,
    },
    /// A test case finished.
    CaseFinished {
        /// The test class.
        class: String,
        /// The test method.
        method: String,
        /// How the case ended.
        status: TestCaseStatus,
        /// Wall-clock duration in seconds.
        duration: f64,
        /// Collected log lines for the case.
        #[serde(default)]
        logs: Vec<String>,
    },
    /// A suite finished.
    SuiteFinished {
        /// The suite name.
        suite: String,
        /// Number of cases run.
        run_count: u64,
        /// Number of failures.
        failure_count: u64,
        /// Number of unexpected exits.
        unexpected_count: u64,
        /// Time spent in test code, seconds.
        test_duration: f64,
        /// Wall-clock suite duration, seconds.
        total_duration: f64,
    },
    /// The runner finished the test plan.
    PlanFinished,
    /// The runner crashed mid-plan.
    Crashed {
        /// A description of the crash.
        message: String,
    },
}

/// What one stdout line decodes to.
#[derive(Clone, Debug)]
pub enum BusFrame {
    /// A runner lifecycle message.
    Message(RunnerMessage),
    /// Raw test output, passed through out-of-band.
    Output(Bytes),
}

/// Decodes one stdout line from the runner.
pub fn decode_line(line: &[u8]) -> CompanionResult<BusFrame> {
    let trimmed = trim_ascii(line);
    if trimmed.is_empty() {
        return Ok(BusFrame::Output(Bytes::new()));
    }
    if trimmed.first() != Some(&b'{') {
        return Ok(BusFrame::Output(Bytes::copy_from_slice(line)));
    }
    match serde_json::from_slice::<RunnerMessage>(trimmed) {
        Ok(message) => Ok(BusFrame::Message(message)),
        Err(error) => Err(CompanionError::Protocol(format!(
            "undecodable runner message `{}`: {error}",
            String::from_utf8_lossy(trimmed),
        ))),
    }
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) => &line[start..=end],
        _ => &[],
    }
}

/// The receiving half of the runner bus.
///
/// Frames (including decode errors) arrive in stdout order; the channel
/// closes when the runner's stdout reaches EOF.
pub struct BusReceiver {
    receiver: mpsc::UnboundedReceiver<CompanionResult<BusFrame>>,
}

impl BusReceiver {
    /// The next frame, or `None` once the runner's stdout has closed.
    pub async fn recv(&mut self) -> Option<CompanionResult<BusFrame>> {
        self.receiver.recv().await
    }
}

/// Builds the line consumer to bind to the runner's stdout, paired with the
/// receiver the drive loop consumes.
pub fn stdout_bus() -> (impl Fn(Bytes) + Send + Sync + 'static, BusReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let consumer = move |line: Bytes| {
        // A send error means the drive loop is gone; remaining output is
        // dropped with it.
        let _ = sender.send(decode_line(&line));
    };
    (consumer, BusReceiver { receiver })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_lifecycle_messages() {
        let frame = decode_line(
            br#"{"event":"case-started","class":"SuiteA","method":"testFoo"}"#,
        )
        .unwrap();
        match frame {
            BusFrame::Message(RunnerMessage::CaseStarted { class, method }) => {
                assert_eq!(class, "SuiteA");
                assert_eq!(method, "testFoo");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_are_output() {
        let frame = decode_line(b"[SuiteA] some log spew").unwrap();
        match frame {
            BusFrame::Output(bytes) => assert_eq!(&bytes[..], b"[SuiteA] some log spew"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn malformed_json_messages_are_protocol_errors() {
        let error = decode_line(br#"{"event":"case-started","class":42}"#).unwrap_err();
        assert!(matches!(error, CompanionError::Protocol(_)), "{error}");
    }

    #[test]
    fn command_lines_round_trip() {
        let line = RunnerCommand::BeginExecution.to_line();
        assert_eq!(line.last(), Some(&b'\n'));
        let parsed: RunnerCommand = serde_json::from_slice(&line).unwrap();
        assert!(matches!(parsed, RunnerCommand::BeginExecution));
    }

    #[test]
    fn status_values_match_wire_vocabulary() {
        let frame = decode_line(
            br#"{"event":"case-finished","class":"A","method":"m","status":"timed-out","duration":1.5}"#,
        )
        .unwrap();
        match frame {
            BusFrame::Message(RunnerMessage::CaseFinished { status, .. }) => {
                assert_eq!(status, TestCaseStatus::TimedOut);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
