// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subprocess supervision with typed stream endpoints.
//!
//! A [`ProcessBuilder`] describes a launch: path, argv, environment and one
//! binding per standard stream. [`ProcessBuilder::start`] resolves the
//! bindings into concrete descriptors, spawns the child and returns a
//! [`Process`] handle exposing the wait status, exit code and signal as
//! operations. [`Process::run_until_completion`] layers acceptable-exit-code
//! checking and SIGTERM-then-SIGKILL cancellation on top.

mod io;

pub use io::{DataConsumer, LineBuffer, MemoryConsumer, OutputSink, StdinSource};

use crate::{
    errors::{CompanionError, CompanionResult},
    operation::Operation,
};
use bytes::Bytes;
use camino::Utf8PathBuf;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::process::{Child, ChildStdin, Command};

/// How the child's environment is derived from the companion's.
#[derive(Clone, Debug, Default)]
pub enum EnvMode {
    /// Inherit the companion's environment, overlaying the given variables.
    #[default]
    Augment,
    /// Start from an empty environment.
    Replace,
}

/// A description of a subprocess launch.
#[derive(Clone)]
pub struct ProcessBuilder {
    launch_path: Utf8PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    env_mode: EnvMode,
    stdin: StdinSource,
    stdout: OutputSink,
    stderr: OutputSink,
}

impl fmt::Debug for ProcessBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBuilder")
            .field("launch_path", &self.launch_path)
            .field("args", &self.args)
            .finish()
    }
}

impl ProcessBuilder {
    /// Creates a builder for the executable at `launch_path`.
    ///
    /// All three streams default to [`discard`](OutputSink::Null).
    pub fn new(launch_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            launch_path: launch_path.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            env_mode: EnvMode::default(),
            stdin: StdinSource::Null,
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets several environment variables for the child.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Replaces the environment instead of augmenting the companion's.
    pub fn replace_environment(mut self) -> Self {
        self.env_mode = EnvMode::Replace;
        self
    }

    /// Binds stdin.
    pub fn stdin(mut self, source: StdinSource) -> Self {
        self.stdin = source;
        self
    }

    /// Binds stdout.
    pub fn stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    /// Binds stderr.
    pub fn stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }

    /// The launch path.
    pub fn launch_path(&self) -> &Utf8PathBuf {
        &self.launch_path
    }

    /// Spawns the child and returns its handle.
    pub fn start(self) -> Operation<Process> {
        let description = self.description();
        Operation::spawn(description.clone(), async move { self.spawn_child() })
    }

    /// A short human-readable description of the launch, for errors/logs.
    pub fn description(&self) -> String {
        self.launch_path.to_string()
    }

    fn spawn_child(self) -> CompanionResult<Process> {
        let mut command = Command::new(self.launch_path.as_std_path());
        command.args(&self.args);
        if matches!(self.env_mode, EnvMode::Replace) {
            command.env_clear();
        }
        command.envs(&self.env);
        command.kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let stdin_attach = io::attach_stdin(&self.stdin, &mut command)?;
        let stdout_attach = io::attach_output(&self.stdout, &mut command, io::Stream::Stdout)?;
        let stderr_attach = io::attach_output(&self.stderr, &mut command, io::Stream::Stderr)?;

        let command_name = self.description();
        let mut child = command.spawn().map_err(|error| {
            CompanionError::io(format!("while spawning `{command_name}`"), error)
        })?;
        let pid = child.id().ok_or_else(|| {
            CompanionError::Internal(format!("child `{command_name}` exited before observation"))
        })?;
        tracing::debug!(command = %command_name, pid, "spawned process");

        let stdin_writer = io::finish_stdin(stdin_attach, &mut child);
        let stdout = io::finish_output(
            stdout_attach,
            child.stdout.take().map(io::PipeReader::Stdout),
            &command_name,
        );
        let stderr = io::finish_output(
            stderr_attach,
            child.stderr.take().map(io::PipeReader::Stderr),
            &command_name,
        );

        Ok(Process::supervise(
            command_name,
            pid,
            child,
            stdin_writer,
            stdout,
            stderr,
        ))
    }
}

/// A running (or exited) subprocess.
///
/// Handles are cheap to clone; all clones observe the same child.
#[derive(Clone)]
pub struct Process {
    command: String,
    pid: u32,
    wait_status: Operation<i32>,
    exit_code: Operation<i32>,
    signal: Operation<i32>,
    stdin_writer: Arc<Mutex<Option<ChildStdin>>>,
    stdout: io::AttachedOutput,
    stderr: io::AttachedOutput,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Process {
    fn supervise(
        command: String,
        pid: u32,
        mut child: Child,
        stdin_writer: Option<ChildStdin>,
        stdout: io::AttachedOutput,
        stderr: io::AttachedOutput,
    ) -> Self {
        let (status_resolver, wait_status) = Operation::resolver("wait-status");
        {
            let command = command.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => status_resolver.resolve(raw_wait_status(status)),
                    Err(error) => status_resolver.fail(CompanionError::io(
                        format!("while waiting for `{command}`"),
                        error,
                    )),
                }
            });
        }

        let exit_code = {
            let command = command.clone();
            wait_status.and_then(move |raw| match decode_wait_status(raw) {
                WaitOutcome::Exited(code) => Operation::done(code),
                WaitOutcome::Signalled(signal) => {
                    Operation::failed(CompanionError::Subprocess {
                        command,
                        description: format!("was terminated by signal {signal}"),
                    })
                }
            })
        };
        let signal = {
            let command = command.clone();
            wait_status.and_then(move |raw| match decode_wait_status(raw) {
                WaitOutcome::Signalled(signal) => Operation::done(signal),
                WaitOutcome::Exited(code) => Operation::failed(CompanionError::Subprocess {
                    command,
                    description: format!("exited normally with code {code}"),
                }),
            })
        };

        Self {
            command,
            pid,
            wait_status,
            exit_code,
            signal,
            stdin_writer: Arc::new(Mutex::new(stdin_writer)),
            stdout,
            stderr,
        }
    }

    /// The child's pid.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The launch path, for diagnostics.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The raw wait status, as returned by the OS.
    pub fn wait_status(&self) -> Operation<i32> {
        self.wait_status.clone()
    }

    /// The exit code; fails with `subprocess` if the child was signalled.
    pub fn exit_code(&self) -> Operation<i32> {
        self.exit_code.clone()
    }

    /// The terminating signal; fails with `subprocess` if the child exited
    /// normally.
    pub fn signal(&self) -> Operation<i32> {
        self.signal.clone()
    }

    /// Takes the stdin writer, if stdin was bound to
    /// [`StdinSource::Stream`]. Subsequent calls return `None`; a stream may
    /// be attached to at most one writer.
    pub fn take_stdin_writer(&self) -> Option<ChildStdin> {
        self.stdin_writer
            .lock()
            .expect("stdin writer lock poisoned")
            .take()
    }

    /// The accumulated stdout, if stdout was bound to [`OutputSink::Bytes`]
    /// or [`OutputSink::Text`]. Resolves at stream close.
    pub fn captured_stdout(&self) -> Option<Operation<Bytes>> {
        self.stdout.captured()
    }

    /// The accumulated stderr, under the same binding rules as
    /// [`captured_stdout`](Self::captured_stdout).
    pub fn captured_stderr(&self) -> Option<Operation<Bytes>> {
        self.stderr.captured()
    }

    /// Sends a raw signal to the child.
    ///
    /// A child that has already been reaped is not an error; the signal is
    /// simply dropped.
    pub fn send_signal(&self, signal: i32) -> CompanionResult<()> {
        send_signal_raw(self.pid, signal, &self.command)
    }

    /// Sends `signal`, then escalates to SIGKILL if the child has not
    /// terminated within `grace`.
    pub fn signal_with_fallback(&self, signal: i32, grace: Duration) -> Operation<i32> {
        let process = self.clone();
        Operation::spawn("signal-with-fallback", async move {
            process.send_signal(signal)?;
            // Shield first: the timeout must cancel only this derived
            // observer, never the shared wait-status operation.
            let status = process
                .wait_status()
                .shield_cancellation()
                .with_timeout(grace, "process termination");
            match status.awaited().await.into_result() {
                Ok(raw) => Ok(raw),
                Err(CompanionError::Timeout { .. }) => {
                    tracing::debug!(
                        pid = process.pid,
                        command = %process.command,
                        "grace period elapsed, sending SIGKILL"
                    );
                    process.send_signal(libc::SIGKILL)?;
                    process.wait_status().awaited().await.into_result()
                }
                Err(error) => Err(error),
            }
        })
    }

    /// Waits for termination and checks the exit code against an acceptable
    /// set, resolving with the terminated handle.
    ///
    /// Cancelling the returned operation sends SIGTERM to the child and
    /// escalates to SIGKILL after `grace`.
    pub fn run_until_completion(
        &self,
        acceptable_exit_codes: Vec<i32>,
        grace: Duration,
    ) -> Operation<Process> {
        let process = self.clone();
        let completion = Operation::spawn("run-until-completion", async move {
            let raw = process.wait_status().shield_cancellation().awaited().await;
            let raw = raw.into_result()?;
            match decode_wait_status(raw) {
                WaitOutcome::Exited(code) if acceptable_exit_codes.contains(&code) => {
                    Ok(process.clone())
                }
                WaitOutcome::Exited(code) => Err(CompanionError::Subprocess {
                    command: process.command.clone(),
                    description: format!(
                        "exited with unexpected code {code} (acceptable: {acceptable_exit_codes:?})"
                    ),
                }),
                WaitOutcome::Signalled(signal) => Err(CompanionError::Subprocess {
                    command: process.command.clone(),
                    description: format!("was terminated by signal {signal}"),
                }),
            }
        });
        let teardown = self.clone();
        completion.on_cancel(move || {
            teardown
                .signal_with_fallback(libc::SIGTERM, grace)
                .map_replace(())
                .fallback(())
        });
        completion
    }
}

enum WaitOutcome {
    Exited(i32),
    Signalled(i32),
}

#[cfg(unix)]
fn raw_wait_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.into_raw()
}

#[cfg(unix)]
fn decode_wait_status(raw: i32) -> WaitOutcome {
    if libc::WIFSIGNALED(raw) {
        WaitOutcome::Signalled(libc::WTERMSIG(raw))
    } else {
        WaitOutcome::Exited(libc::WEXITSTATUS(raw))
    }
}

#[cfg(unix)]
fn send_signal_raw(pid: u32, signal: i32, command: &str) -> CompanionResult<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };
    let signal = Signal::try_from(signal).map_err(|_| {
        CompanionError::invalid_argument(format!("unknown signal number {signal}"))
    })?;
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        // The child may have been reaped between the caller's check and the
        // kill; that is not a failure of the signal operation.
        Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(CompanionError::io(
            format!("while signalling `{command}` (pid {pid})"),
            std::io::Error::from_raw_os_error(errno as i32),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;

    fn sh(script: &str) -> ProcessBuilder {
        ProcessBuilder::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_stdout_bytes() {
        let process = sh("printf 'hello'")
            .stdout(OutputSink::Bytes)
            .start()
            .await
            .unwrap();
        let captured = process.captured_stdout().expect("stdout was bound to bytes");
        assert_eq!(&captured.await.unwrap()[..], b"hello");
        assert_eq!(process.exit_code().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn feeds_stdin_data() {
        let process = sh("cat")
            .stdin(StdinSource::Data(Bytes::from_static(b"roundtrip")))
            .stdout(OutputSink::Bytes)
            .start()
            .await
            .unwrap();
        let captured = process.captured_stdout().unwrap();
        assert_eq!(&captured.await.unwrap()[..], b"roundtrip");
    }

    #[tokio::test]
    async fn line_consumer_frames_on_newlines() {
        let lines: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = {
            let lines = lines.clone();
            OutputSink::line_consumer(move |line: Bytes| {
                lines
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&line).into_owned());
            })
        };
        let process = sh("printf 'one\\ntwo\\nthree'")
            .stdout(sink)
            .start()
            .await
            .unwrap();
        process.exit_code().await.unwrap();
        // The reader task flushes the unterminated remainder at EOF; wait
        // for the stream to close.
        process.stdout.closed().await;
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn exit_code_fails_for_signalled_child() {
        let process = sh("kill -TERM $$; sleep 10").start().await.unwrap();
        let error = process.exit_code().await.unwrap_err();
        assert!(matches!(error, CompanionError::Subprocess { .. }), "{error}");
        assert_eq!(process.signal().await.unwrap(), libc::SIGTERM);
    }

    #[tokio::test]
    async fn run_until_completion_checks_acceptable_codes() {
        let process = sh("exit 3").start().await.unwrap();
        let ok = process
            .run_until_completion(vec![0, 3], Duration::from_secs(1))
            .await;
        assert!(ok.is_ok());

        let process = sh("exit 4").start().await.unwrap();
        let error = process
            .run_until_completion(vec![0], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, CompanionError::Subprocess { .. }), "{error}");
    }

    #[tokio::test]
    async fn cancelling_completion_terminates_child() {
        let process = sh("sleep 30").start().await.unwrap();
        let completion =
            process.run_until_completion(vec![0], Duration::from_millis(500));
        completion.cancel().await.unwrap();
        assert_eq!(completion.state(), OperationState::Cancelled);
        // The child terminated via SIGTERM within the grace window.
        assert_eq!(process.signal().await.unwrap(), libc::SIGTERM);
    }
}
