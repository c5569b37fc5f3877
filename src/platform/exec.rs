//! Bounded, optionally privileged command execution.
//!
//! Every probe that shells out (archive filter, journal query, queue listing,
//! session listing) goes through [`CommandRunner`]. The production runner,
//! [`PrivilegedExecutor`], prefixes a non-interactive escalation command,
//! drains stdout and stderr on dedicated threads while polling the child for
//! exit, and terminates the whole process group once the timeout elapses.

#![allow(missing_docs)]

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use crate::core::config::Config;
use crate::logger::activity::ActivityLoggerHandle;
use crate::logger::jsonl::{ActivityEntry, EventType, Severity};

/// Exit code reported when the child was killed or never reported one.
pub const EXIT_SENTINEL: i32 = -1;

/// How long to wait for the drain threads after the child is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Result of one command invocation. Never an error: failures are encoded
/// as a non-zero exit code with whatever output was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code 1 with no output: escalation or spawn was impossible.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            exit_code: 1,
            ..Self::default()
        }
    }

    /// Successful run with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Runs an argv with a wall-clock bound.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[&str], timeout: Duration) -> CommandOutput;
}

/// Escalation wrapper placed in front of every command, e.g. `sudo -n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Production [`CommandRunner`].
#[derive(Debug, Clone)]
pub struct PrivilegedExecutor {
    escalation: Option<Escalation>,
    poll_interval: Duration,
    kill_grace: Duration,
    logger: ActivityLoggerHandle,
}

impl PrivilegedExecutor {
    #[must_use]
    pub fn new(
        escalation: Option<Escalation>,
        poll_interval: Duration,
        kill_grace: Duration,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            escalation,
            poll_interval,
            kill_grace,
            logger,
        }
    }

    /// Executor per config. Escalation is dropped when disabled or when the
    /// process already runs as root.
    #[must_use]
    pub fn from_config(config: &Config, logger: ActivityLoggerHandle) -> Self {
        let escalation = (config.privilege.escalate && !running_as_root()).then(|| Escalation {
            program: config.privilege.program.clone(),
            args: config.privilege.args.clone(),
        });
        Self::new(
            escalation,
            Duration::from_millis(config.timeouts.poll_interval_ms),
            Duration::from_millis(config.timeouts.kill_grace_ms),
            logger,
        )
    }

    fn command_for(&self, argv: &[&str]) -> Option<Command> {
        let (program, args) = argv.split_first()?;
        let mut command = if let Some(esc) = &self.escalation {
            let mut command = Command::new(&esc.program);
            command.args(&esc.args).arg(program);
            command
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Some(command)
    }

    fn report_failure(&self, program: &str, details: String) {
        self.logger.send(
            ActivityEntry::new(EventType::CommandFailed, Severity::Warning)
                .program(program)
                .exit_code(1)
                .details(details),
        );
    }

    /// SIGTERM the group, give it `kill_grace`, then SIGKILL and reap.
    fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        signal_group(child, GroupSignal::Terminate);
        let deadline = Instant::now() + self.kill_grace;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status);
            }
            thread::sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now())));
        }
        signal_group(child, GroupSignal::Kill);
        let _ = child.kill();
        child.wait().ok()
    }
}

impl CommandRunner for PrivilegedExecutor {
    fn run(&self, argv: &[&str], timeout: Duration) -> CommandOutput {
        let Some(program) = argv.first().copied() else {
            return CommandOutput::unavailable();
        };
        if let Some(esc) = &self.escalation
            && !esc.program.is_file()
        {
            self.report_failure(
                program,
                format!("escalation program {} not found", esc.program.display()),
            );
            return CommandOutput::unavailable();
        }
        let Some(mut command) = self.command_for(argv) else {
            return CommandOutput::unavailable();
        };

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                self.report_failure(program, format!("spawn failed: {error}"));
                return CommandOutput::unavailable();
            }
        };

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = bounded::<()>(2);
        let mut readers = 0;
        if let Some(pipe) = child.stdout.take() {
            readers += usize::from(spawn_drain(pipe, Arc::clone(&stdout_buf), done_tx.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers += usize::from(spawn_drain(pipe, Arc::clone(&stderr_buf), done_tx.clone()));
        }
        drop(done_tx);

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(_) => break child.wait().ok(),
            }
            if started.elapsed() >= timeout {
                timed_out = true;
                break self.terminate(&mut child);
            }
            thread::sleep(self.poll_interval);
        };

        let reader_deadline = Instant::now() + READER_GRACE;
        for _ in 0..readers {
            let remaining = reader_deadline.saturating_duration_since(Instant::now());
            if done_rx.recv_timeout(remaining).is_err() {
                break;
            }
        }

        let exit_code = if timed_out {
            EXIT_SENTINEL
        } else {
            status.and_then(|s| s.code()).unwrap_or(EXIT_SENTINEL)
        };
        if timed_out {
            self.logger.send(
                ActivityEntry::new(EventType::CommandTimeout, Severity::Warning)
                    .program(program)
                    .exit_code(exit_code)
                    .duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
            );
        }

        CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_buf.lock()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf.lock()).into_owned(),
            timed_out,
        }
    }
}

/// Whether the effective user is root.
pub fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Copy a pipe into `sink` until EOF on a dedicated thread. The thread owns
/// the pipe, so it is closed whichever way the thread ends.
fn spawn_drain<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>, done: Sender<()>) -> bool
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("mailpulse-drain".to_string())
        .spawn(move || {
            let mut chunk = [0_u8; 8 * 1024];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            let _ = done.send(());
        })
        .is_ok()
}

#[derive(Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: GroupSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let _ = killpg(Pid::from_raw(raw), signal);
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: GroupSignal) {}

/// Canned [`CommandRunner`] for deterministic tests.
///
/// Responses are matched by program and, optionally, a substring of the
/// joined arguments; the first matching rule wins. Unmatched commands answer
/// [`CommandOutput::unavailable`]. Every call is recorded.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, Option<String>, CommandOutput)>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every invocation of `program` with `output`.
    #[must_use]
    pub fn respond(mut self, program: impl Into<String>, output: CommandOutput) -> Self {
        self.rules.push((program.into(), None, output));
        self
    }

    /// Answer invocations of `program` whose arguments contain `needle`.
    #[must_use]
    pub fn respond_when(
        mut self,
        program: impl Into<String>,
        needle: impl Into<String>,
        output: CommandOutput,
    ) -> Self {
        self.rules.push((program.into(), Some(needle.into()), output));
        self
    }

    /// Every argv seen so far, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, argv: &[&str], _timeout: Duration) -> CommandOutput {
        self.calls
            .lock()
            .push(argv.iter().map(|arg| (*arg).to_string()).collect());
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput::unavailable();
        };
        let joined = args.join(" ");
        self.rules
            .iter()
            .find(|(rule_program, needle, _)| {
                rule_program == program && needle.as_ref().is_none_or(|n| joined.contains(n.as_str()))
            })
            .map_or_else(CommandOutput::unavailable, |(_, _, output)| output.clone())
    }
}
