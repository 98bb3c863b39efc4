//! External command execution with explicit timeouts.
//!
//! Every subprocess the enrollment workflow starts is described by a [`Cmd`]
//! and executed by a [`CommandRunner`]. Running a command never panics and
//! never hangs forever: each `Cmd` carries a deadline, and a process that
//! outlives it is killed and reported as [`CmdError::Timeout`].
//!
//! A process that exits non-zero is *not* a runner error. It comes back as a
//! [`CmdResult`] whose [`success`](CmdResult::success) is false, so callers
//! decide for themselves whether that is fatal.
//!
//! ```rust,ignore
//! use lintune::process::{Cmd, SystemRunner};
//!
//! let runner = SystemRunner;
//! let result = Cmd::new("systemctl")
//!     .args(["is-active", "himmelblaud.service"])
//!     .timeout_secs(2)
//!     .allow_fail()
//!     .run(&runner)?;
//! println!("active: {}", result.success());
//! ```

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use thiserror::Error;
use tracing::debug;

/// Deadline applied when a command does not declare its own.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Description of a command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Duration,
    allow_fail: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` to the process on stdin. Never shown by `Display`.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    /// Non-zero exit is returned as a result instead of an error by [`Cmd::run`].
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Message used when [`Cmd::run`] turns a non-zero exit into an error.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Re-target this command behind a wrapper such as `sudo -S`.
    ///
    /// The original program becomes the first argument after `leading`.
    pub fn wrapped(mut self, wrapper: &str, leading: &[&str]) -> Self {
        let mut args: Vec<String> = leading.iter().map(|s| s.to_string()).collect();
        args.push(std::mem::replace(&mut self.program, wrapper.to_string()));
        args.append(&mut self.args);
        self.args = args;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// True when `program` and the leading arguments match `words`.
    pub fn starts_with(&self, words: &[&str]) -> bool {
        let mut parts = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        words.iter().all(|word| parts.next() == Some(*word))
    }

    /// Run with `runner`, failing on non-zero exit unless [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CmdResult> {
        let result = runner.exec(self)?;
        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self));
            bail!("{}: {}", msg, result.message_or("no output"));
        }
        Ok(result)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured outcome of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// First non-empty of trimmed stderr, trimmed stdout, then `fallback`.
    pub fn message_or(&self, fallback: &str) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        fallback.to_string()
    }
}

/// Reasons a command could not produce a [`CmdResult`].
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' timed out after {}s", .after.as_secs())]
    Timeout { command: String, after: Duration },
    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CmdError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CmdError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CmdError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Seam between the workflow and the operating system's process table.
pub trait CommandRunner: Send + Sync {
    fn exec(&self, cmd: &Cmd) -> Result<CmdResult, CmdError>;

    /// Like [`exec`](CommandRunner::exec), delivering output lines as they arrive.
    fn exec_streaming(
        &self,
        cmd: &Cmd,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CmdResult, CmdError> {
        let result = self.exec(cmd)?;
        for line in result.stdout.lines().chain(result.stderr.lines()) {
            on_line(line);
        }
        Ok(result)
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn exec(&self, cmd: &Cmd) -> Result<CmdResult, CmdError> {
        drive(cmd, None)
    }

    fn exec_streaming(
        &self,
        cmd: &Cmd,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CmdResult, CmdError> {
        drive(cmd, Some(on_line))
    }
}

enum Chunk {
    Out(String),
    Err(String),
}

fn spawn_reader<R>(stream: R, tx: Sender<Chunk>, wrap: fn(String) -> Chunk)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(std::result::Result::ok) {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

fn drive(cmd: &Cmd, mut on_line: Option<&mut dyn FnMut(&str)>) -> Result<CmdResult, CmdError> {
    debug!(command = %cmd, timeout_secs = cmd.timeout.as_secs(), "running");

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    if let Some(dir) = &cmd.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &cmd.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CmdError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;

    if let (Some(input), Some(mut pipe)) = (&cmd.stdin, child.stdin.take()) {
        if let Err(source) = pipe.write_all(input.as_bytes()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CmdError::Io {
                command: cmd.to_string(),
                source,
            });
        }
    }

    let (tx, rx) = mpsc::channel();
    if let Some(out) = child.stdout.take() {
        spawn_reader(out, tx.clone(), Chunk::Out);
    }
    if let Some(err) = child.stderr.take() {
        spawn_reader(err, tx.clone(), Chunk::Err);
    }
    drop(tx);

    let deadline = Instant::now() + cmd.timeout;
    let timed_out = |child: &mut std::process::Child| {
        let _ = child.kill();
        let _ = child.wait();
        CmdError::Timeout {
            command: cmd.to_string(),
            after: cmd.timeout,
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(&mut child));
        }
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(Chunk::Out(line)) => {
                if let Some(cb) = on_line.as_mut() {
                    cb(&line);
                }
                stdout.push_str(&line);
                stdout.push('\n');
            }
            Ok(Chunk::Err(line)) => {
                if let Some(cb) = on_line.as_mut() {
                    cb(&line);
                }
                stderr.push_str(&line);
                stderr.push('\n');
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(CmdResult {
                    status: status.code(),
                    stdout,
                    stderr,
                })
            }
            Ok(None) if Instant::now() >= deadline => return Err(timed_out(&mut child)),
            Ok(None) => thread::sleep(POLL_INTERVAL / 2),
            Err(source) => {
                return Err(CmdError::Io {
                    command: cmd.to_string(),
                    source,
                })
            }
        }
    }
}
