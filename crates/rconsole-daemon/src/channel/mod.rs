//! Child process with redirected stdio pipes.
//!
//! [`ChildProcessChannel`] owns one spawned command interpreter and the
//! parent-side ends of its stdin and stdout pipes. Reads are peek-gated so a
//! polling loop never blocks on an idle pipe; the stdin end is non-blocking,
//! so a child that stops reading surfaces as `WouldBlock` instead of a stuck
//! writer. The child's stderr shares the stdout pipe.
//!
//! Reads and writes take `&self` and touch disjoint descriptors, so one
//! thread can drain stdout while another feeds stdin.

mod pipe;

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Default bound on how long `terminate` waits for the OS to reap the child.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Program and arguments of the interpreter to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Lifecycle of a channel. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotStarted,
    Running,
    Terminated,
}

#[derive(Debug)]
struct ProcessSlot {
    child: Option<Child>,
    state: ChannelState,
    exit_status: Option<ExitStatus>,
    /// The detached process group has been sent SIGKILL.
    group_killed: bool,
}

impl ProcessSlot {
    fn mark_exited(&mut self, status: Option<ExitStatus>) {
        self.state = ChannelState::Terminated;
        if status.is_some() {
            self.exit_status = status;
        }
    }
}

/// A spawned process plus the parent's ends of its stdin/stdout pipes.
#[derive(Debug)]
pub struct ChildProcessChannel {
    process: Mutex<ProcessSlot>,
    stdin: Option<File>,
    stdout: Option<File>,
    pid: Option<u32>,
    detached: bool,
    terminate_timeout: Duration,
}

impl Default for ChildProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildProcessChannel {
    pub const fn new() -> Self {
        Self::with_terminate_timeout(DEFAULT_TERMINATE_TIMEOUT)
    }

    pub const fn with_terminate_timeout(terminate_timeout: Duration) -> Self {
        Self {
            process: Mutex::new(ProcessSlot {
                child: None,
                state: ChannelState::NotStarted,
                exit_status: None,
                group_killed: false,
            }),
            stdin: None,
            stdout: None,
            pid: None,
            detached: false,
            terminate_timeout,
        }
    }

    /// Spawn `command` with stdin, stdout and stderr redirected to pipes.
    ///
    /// With `hide_window` the child gets its own process group, so signals
    /// generated by the host's terminal never reach it and `terminate` can
    /// take down everything it started.
    pub fn start(&mut self, command: &ShellCommand, hide_window: bool) -> Result<(), ChannelError> {
        if self.state() != ChannelState::NotStarted {
            return Err(ChannelError::AlreadyStarted);
        }

        let spawn_failed = |source: io::Error| ChannelError::SpawnFailed {
            command: command.display(),
            source,
        };

        let stdin_pipe = pipe::create_pipe().map_err(spawn_failed)?;
        pipe::set_nonblocking(stdin_pipe.write.as_fd()).map_err(spawn_failed)?;
        let stdout_pipe = pipe::create_pipe().map_err(spawn_failed)?;
        let stderr_writer = stdout_pipe.write.try_clone().map_err(spawn_failed)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::from(stdin_pipe.read))
            .stdout(Stdio::from(stdout_pipe.write))
            .stderr(Stdio::from(stderr_writer));
        if hide_window {
            cmd.process_group(0);
        }

        let spawned = cmd.spawn();
        // The command holds the child's pipe ends; drop it so the parent keeps
        // only its own ends and EOF/EPIPE propagate once the child is gone.
        drop(cmd);
        let child = spawned.map_err(spawn_failed)?;

        let pid = child.id();
        info!(pid, command = %command.display(), detached = hide_window, "Spawned child process");

        self.stdin = Some(File::from(stdin_pipe.write));
        self.stdout = Some(File::from(stdout_pipe.read));
        self.pid = Some(pid);
        self.detached = hide_window;
        let slot = self.slot_mut();
        slot.child = Some(child);
        slot.state = ChannelState::Running;
        Ok(())
    }

    /// Write `bytes` to the child's stdin, returning how many were accepted.
    ///
    /// Never blocks: a full pipe yields `ChannelError::Io` of kind
    /// `WouldBlock`, and short writes are possible. A child that exited
    /// before `is_running` noticed yields `BrokenPipe`.
    pub fn write_stdin(&self, bytes: &[u8]) -> Result<usize, ChannelError> {
        if self.state() != ChannelState::Running {
            return Err(ChannelError::NotRunning);
        }
        let mut writer = self.stdin.as_ref().ok_or(ChannelError::NotRunning)?;
        loop {
            match writer.write(bytes) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result.map_err(ChannelError::Io),
            }
        }
    }

    /// Write all of `bytes`, retrying short writes and waiting while the
    /// pipe is full. Unbounded if the child never reads; the relay uses
    /// [`Self::write_stdin`] so it can give up on cancellation.
    pub fn write_all_stdin(&self, mut bytes: &[u8]) -> Result<(), ChannelError> {
        while !bytes.is_empty() {
            match self.write_stdin(bytes) {
                Ok(0) => return Err(ChannelError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => bytes = &bytes[n..],
                Err(ChannelError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(EXIT_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bytes currently buffered in the stdout pipe.
    pub fn bytes_available(&self) -> Result<usize, ChannelError> {
        let reader = self.stdout.as_ref().ok_or(ChannelError::NotRunning)?;
        Ok(pipe::bytes_available(reader.as_fd())?)
    }

    /// Read at most `max_bytes` of already-buffered output. Returns an empty
    /// vector instead of blocking when nothing is buffered.
    ///
    /// Output left in the pipe stays readable after the child exits.
    pub fn read_stdout(&self, max_bytes: usize) -> Result<Vec<u8>, ChannelError> {
        let available = self.bytes_available()?;
        let to_read = available.min(max_bytes);
        if to_read == 0 {
            return Ok(Vec::new());
        }

        let mut reader = self.stdout.as_ref().ok_or(ChannelError::NotRunning)?;
        let mut buf = vec![0u8; to_read];
        let n = loop {
            match reader.read(&mut buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => break result?,
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    /// Whether the child is still alive, asking the OS rather than trusting
    /// local state. Observing an exit moves the channel to `Terminated`.
    pub fn is_running(&self) -> bool {
        let mut slot = self.slot();
        if slot.state != ChannelState::Running {
            return false;
        }
        let Some(child) = slot.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = self.pid, ?status, "Child process exited");
                slot.mark_exited(Some(status));
                false
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to query child status");
                false
            }
        }
    }

    /// Wait up to `timeout` for the child to exit on its own. Returns `true`
    /// once it is no longer running.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Forcibly end the child (SIGKILL, to the whole group when detached) and
    /// wait up to the terminate timeout for it to be reaped.
    ///
    /// A detached group is killed even when its leader already exited, so
    /// background jobs the shell left behind do not outlive the channel.
    /// The channel is `Terminated` afterwards even if the wait timed out.
    /// Calling this again, or on a channel never started, is a successful
    /// no-op.
    pub fn terminate(&mut self) -> Result<(), ChannelError> {
        let pid = self.pid;
        let detached = self.detached;
        let timeout = self.terminate_timeout;
        let slot = self
            .process
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        if slot.state == ChannelState::NotStarted {
            return Ok(());
        }
        if detached && !slot.group_killed {
            if let Some(pgid) = pid {
                kill_process_group(pgid)?;
                debug!(pgid, "Killed child process group");
            }
            slot.group_killed = true;
        }
        if slot.state != ChannelState::Running {
            return Ok(());
        }

        let Some(child) = slot.child.as_mut() else {
            slot.mark_exited(None);
            return Ok(());
        };
        if let Some(status) = child.try_wait()? {
            debug!(pid, ?status, "Child already exited before terminate");
            slot.mark_exited(Some(status));
            return Ok(());
        }
        if !detached {
            child.kill()?;
        }

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => {
                    warn!(pid, ?timeout, "Child not reaped within terminate timeout");
                    break None;
                }
                Err(e) => {
                    warn!(pid, error = %e, "Error waiting for terminated child");
                    break None;
                }
            }
        };

        info!(pid, ?status, "Terminated child process");
        slot.mark_exited(status);
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        self.slot().state
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.slot().exit_status
    }

    pub const fn is_detached(&self) -> bool {
        self.detached
    }

    fn slot(&self) -> MutexGuard<'_, ProcessSlot> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_mut(&mut self) -> &mut ProcessSlot {
        self.process
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ChildProcessChannel {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!(pid = self.pid, error = %e, "Failed to terminate child on drop");
        }
        // Pipe ends are owned `File`s and close exactly once when dropped.
        self.stdin.take();
        self.stdout.take();
    }
}

fn kill_process_group(pgid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg(2) only sends a signal; `pgid` is the group our own
    // child leads since it was spawned with `process_group(0)`.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // An empty group has nothing left to kill.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Errors from channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel already started")]
    AlreadyStarted,

    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Channel is not running")]
    NotRunning,

    #[error("Pipe I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ChannelError> for io::Error {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Io(e) => e,
            ChannelError::NotRunning => Self::new(io::ErrorKind::BrokenPipe, error),
            other => Self::other(other),
        }
    }
}

impl ChannelError {
    /// Start-up failures; everything else is a mid-session I/O failure.
    pub const fn is_spawn_error(&self) -> bool {
        matches!(self, Self::AlreadyStarted | Self::SpawnFailed { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sh() -> ShellCommand {
        ShellCommand::new("/bin/sh")
    }

    fn started() -> ChildProcessChannel {
        let mut channel = ChildProcessChannel::new();
        channel.start(&sh(), true).unwrap();
        channel
    }

    fn read_until(channel: &ChildProcessChannel, needle: &str, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while Instant::now() < deadline {
            out.extend(channel.read_stdout(4096).unwrap());
            if String::from_utf8_lossy(&out).contains(needle) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn echo_round_trip() {
        let channel = started();
        assert!(channel.is_running());
        channel.write_all_stdin(b"echo hi\r\n").unwrap();
        let out = read_until(&channel, "hi", Duration::from_secs(5));
        assert!(out.contains("hi"), "output was {out:?}");
    }

    #[test]
    fn stderr_shares_the_stdout_pipe() {
        let channel = started();
        channel.write_all_stdin(b"echo oops 1>&2\n").unwrap();
        let out = read_until(&channel, "oops", Duration::from_secs(5));
        assert!(out.contains("oops"));
    }

    #[test]
    fn read_with_nothing_buffered_is_empty() {
        let channel = started();
        assert!(channel.read_stdout(4096).unwrap().is_empty());
        assert_eq!(channel.bytes_available().unwrap(), 0);
    }

    #[test]
    fn read_respects_max_bytes() {
        let channel = started();
        channel.write_all_stdin(b"echo abcdefgh\n").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while channel.bytes_available().unwrap() < 9 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(channel.read_stdout(3).unwrap(), b"abc");
        assert_eq!(channel.read_stdout(4096).unwrap(), b"defgh\n");
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut channel = started();
        let err = channel.start(&sh(), true).unwrap_err();
        assert!(matches!(err, ChannelError::AlreadyStarted));
        assert!(err.is_spawn_error());
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let mut channel = ChildProcessChannel::new();
        let err = channel
            .start(&ShellCommand::new("/nonexistent/rconsole-no-such-shell"), false)
            .unwrap_err();
        assert!(matches!(err, ChannelError::SpawnFailed { .. }));
        assert_eq!(channel.state(), ChannelState::NotStarted);
        assert!(channel.pid().is_none());
    }

    #[test]
    fn io_before_start_is_not_running() {
        let channel = ChildProcessChannel::new();
        assert!(matches!(channel.write_stdin(b"x"), Err(ChannelError::NotRunning)));
        assert!(matches!(channel.read_stdout(16), Err(ChannelError::NotRunning)));
        assert!(!channel.is_running());
    }

    #[test]
    fn natural_exit_is_detected_and_blocks_writes() {
        let channel = started();
        channel.write_all_stdin(b"exit 3\n").unwrap();
        assert!(channel.wait_for_exit(Duration::from_secs(5)));
        assert!(!channel.is_running());
        assert_eq!(channel.state(), ChannelState::Terminated);
        assert_eq!(channel.exit_status().and_then(|s| s.code()), Some(3));
        assert!(matches!(channel.write_stdin(b"echo late\n"), Err(ChannelError::NotRunning)));
    }

    #[test]
    fn write_after_unobserved_exit_is_broken_pipe() {
        let channel = started();
        channel.write_all_stdin(b"exit 0\n").unwrap();

        // Keep writing without asking `is_running`, so the channel still
        // believes the child is alive when the pipe breaks.
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match channel.write_stdin(b"\n") {
                Ok(_) => {
                    assert!(Instant::now() < deadline, "child never closed its stdin");
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => break e,
            }
        };
        assert!(
            matches!(&err, ChannelError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe),
            "unexpected error {err:?}"
        );
        assert_eq!(channel.state(), ChannelState::Running);
        assert!(!channel.is_running());
    }

    #[test]
    fn stdin_write_to_idle_reader_never_blocks() {
        let mut channel = ChildProcessChannel::new();
        channel
            .start(&ShellCommand::new("/bin/sleep").arg("30"), true)
            .unwrap();

        let chunk = vec![b'x'; 64 * 1024];
        let begin = Instant::now();
        let err = loop {
            match channel.write_stdin(&chunk) {
                Ok(_) => assert!(begin.elapsed() < Duration::from_secs(5)),
                Err(e) => break e,
            }
        };
        assert!(
            matches!(&err, ChannelError::Io(e) if e.kind() == io::ErrorKind::WouldBlock),
            "unexpected error {err:?}"
        );
        assert!(channel.is_running());
        channel.terminate().unwrap();
    }

    #[test]
    fn not_running_converts_to_broken_pipe() {
        let err = io::Error::from(ChannelError::NotRunning);
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let err = io::Error::from(ChannelError::Io(io::ErrorKind::WouldBlock.into()));
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn output_is_drainable_after_exit() {
        let channel = started();
        channel.write_all_stdin(b"echo bye; exit\n").unwrap();
        assert!(channel.wait_for_exit(Duration::from_secs(5)));
        let out = read_until(&channel, "bye", Duration::from_secs(1));
        assert!(out.contains("bye"));
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut channel = started();
        channel.terminate().unwrap();
        assert_eq!(channel.state(), ChannelState::Terminated);
        assert!(!channel.is_running());
        channel.terminate().unwrap();
        assert_eq!(channel.state(), ChannelState::Terminated);
    }

    /// Whether `pid` is gone (or only a zombie awaiting its reaper).
    #[cfg(target_os = "linux")]
    fn process_is_dead(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with(['Z', 'X'])),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminate_kills_jobs_left_in_detached_group() {
        let mut channel = started();
        channel
            .write_all_stdin(b"sleep 77 & echo bg:$!; exit 0\n")
            .unwrap();
        let out = read_until(&channel, "\n", Duration::from_secs(5));
        let job_pid = out
            .lines()
            .find_map(|line| line.strip_prefix("bg:"))
            .expect("background pid")
            .trim()
            .to_string();
        assert!(channel.wait_for_exit(Duration::from_secs(5)));
        assert!(!process_is_dead(&job_pid), "job should outlive the shell");

        channel.terminate().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_is_dead(&job_pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(process_is_dead(&job_pid), "job {job_pid} survived terminate");
        channel.terminate().unwrap();
    }

    #[test]
    fn terminate_without_start_is_noop() {
        let mut channel = ChildProcessChannel::new();
        channel.terminate().unwrap();
        assert_eq!(channel.state(), ChannelState::NotStarted);
    }

    #[test]
    fn terminated_channel_cannot_restart() {
        let mut channel = started();
        channel.terminate().unwrap();
        assert!(matches!(channel.start(&sh(), true), Err(ChannelError::AlreadyStarted)));
    }

    #[test]
    fn terminate_without_detach_kills_child() {
        let mut channel = ChildProcessChannel::new();
        channel.start(&sh(), false).unwrap();
        assert!(!channel.is_detached());
        channel.terminate().unwrap();
        assert!(channel.exit_status().is_some_and(|s| !s.success()));
    }

    #[test]
    fn drop_of_running_channel_returns_promptly() {
        let channel = started();
        let begin = Instant::now();
        drop(channel);
        assert!(begin.elapsed() < DEFAULT_TERMINATE_TIMEOUT);
    }

    #[test]
    fn command_display_joins_args() {
        let cmd = ShellCommand::new("/bin/sh").arg("-c").arg("true");
        assert_eq!(cmd.display(), "/bin/sh -c true");
    }
}
