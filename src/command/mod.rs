//! Command execution: substrates, normalization, sessions
//!
//! A [`Command`] runs one normalized program configuration under one of two
//! substrates: [`NativeCommand`] wires the child's standard streams to
//! pipes; [`VirtualCommand`] attaches the child to a pseudo-terminal. The
//! selection rule lives in [`Command::new`].

pub mod config;
pub mod kernel;
pub mod native;
pub mod normalizer;
pub mod pty;
pub mod session;
pub mod virt;

use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::error::Error;
pub use config::{CommandMode, ProgramConfig, Source};
pub use kernel::{Kernel, LocalKernel};
pub use native::NativeCommand;
pub use session::{Session, SessionStore};
pub use virt::VirtualCommand;

/// Boxed async reader endpoint
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed async writer endpoint
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stdin endpoint for a command.
///
/// A real file is handed to the child directly (after duplication, so that
/// closing the server's copy does not disturb the caller's descriptor); any
/// other reader is pumped through a pipe or the PTY master.
pub enum CommandStdin {
    /// A duplicable OS file
    File(std::fs::File),
    /// An arbitrary async byte stream
    Reader(BoxedReader),
}

/// Collaborators and I/O endpoints for a command.
///
/// All endpoints are explicit optional values; an absent endpoint is never
/// pumped.
pub struct CommandOptions {
    /// Execution substrate configuration
    pub kernel: Arc<dyn Kernel>,
    /// Session supplying and receiving environment state
    pub session: Arc<Session>,
    /// Child stdin source
    pub stdin: Option<CommandStdin>,
    /// Child stdout sink
    pub stdout: Option<BoxedWriter>,
    /// Child stderr sink (merged into stdout on the PTY substrate)
    pub stderr: Option<BoxedWriter>,
    /// Path the env-dump expression writes to, when capture is enabled
    pub env_dump_path: Option<PathBuf>,
}

/// Signals a command can deliver to its child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSignal {
    /// SIGINT
    Interrupt,
    /// SIGKILL
    Kill,
}

impl CommandSignal {
    fn to_rustix(self) -> rustix::process::Signal {
        match self {
            CommandSignal::Interrupt => rustix::process::Signal::Int,
            CommandSignal::Kill => rustix::process::Signal::Kill,
        }
    }
}

/// A running or runnable command under one of the two substrates
pub enum Command {
    /// Pipe substrate
    Native(NativeCommand),
    /// PTY substrate
    Virtual(VirtualCommand),
}

impl Command {
    /// Select a substrate for the configuration and build the command.
    ///
    /// The PTY substrate is chosen iff the execution is interactive or in
    /// terminal mode.
    pub fn new(cfg: ProgramConfig, opts: CommandOptions) -> Self {
        if cfg.interactive || cfg.mode == CommandMode::Terminal {
            Command::Virtual(VirtualCommand::new(cfg, opts))
        } else {
            Command::Native(NativeCommand::new(cfg, opts))
        }
    }

    /// Normalize the configuration and launch the child
    pub async fn start(&mut self) -> Result<(), Error> {
        match self {
            Command::Native(cmd) => cmd.start().await,
            Command::Virtual(cmd) => cmd.start().await,
        }
    }

    /// Child pid, available once started
    pub fn pid(&self) -> Option<u32> {
        match self {
            Command::Native(cmd) => cmd.pid(),
            Command::Virtual(cmd) => cmd.pid(),
        }
    }

    /// Whether the child has started and not yet been reaped
    pub fn running(&self) -> bool {
        match self {
            Command::Native(cmd) => cmd.running(),
            Command::Virtual(cmd) => cmd.running(),
        }
    }

    /// Reap the child, terminate the I/O pumps and run cleanups.
    ///
    /// Returns the exit status; I/O and cleanup failures surface as the
    /// error while the status remains available via
    /// [`Command::exit_status`].
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        match self {
            Command::Native(cmd) => cmd.wait().await,
            Command::Virtual(cmd) => cmd.wait().await,
        }
    }

    /// Exit status observed by [`Command::wait`], if any
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Command::Native(cmd) => cmd.exit_status(),
            Command::Virtual(cmd) => cmd.exit_status(),
        }
    }

    /// The materialized environment of the executed plan, once started
    pub fn plan_env(&self) -> &[String] {
        match self {
            Command::Native(cmd) => cmd.plan_env(),
            Command::Virtual(cmd) => cmd.plan_env(),
        }
    }

    /// Cloneable handle for delivering signals while the command is waited on
    pub fn signal_handle(&self) -> SignalHandle {
        match self {
            Command::Native(cmd) => cmd.signal_handle(),
            Command::Virtual(cmd) => cmd.signal_handle(),
        }
    }

    /// Cloneable handle for terminal resizes; `None` on the pipe substrate
    pub fn winsize_handle(&self) -> Option<WinsizeHandle> {
        match self {
            Command::Native(_) => None,
            Command::Virtual(cmd) => Some(cmd.winsize_handle()),
        }
    }
}

/// Delivers signals to a command's child without borrowing the command.
///
/// The fallback chain is an explicit ordered list of attempts: process
/// group (when enabled), the process itself, then SIGKILL.
#[derive(Clone)]
pub struct SignalHandle {
    pid: Arc<AtomicU32>,
    group_first: bool,
}

impl SignalHandle {
    pub(crate) fn new(pid: Arc<AtomicU32>, group_first: bool) -> Self {
        Self { pid, group_first }
    }

    /// Deliver a signal through the fallback chain
    pub fn signal(&self, sig: CommandSignal) -> Result<(), Error> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(Error::startup("command has not started"));
        }
        deliver_signal(pid, sig, self.group_first)
    }
}

fn deliver_signal(pid: u32, sig: CommandSignal, group_first: bool) -> Result<(), Error> {
    let target = rustix::process::Pid::from_raw(pid as i32)
        .ok_or_else(|| Error::startup("invalid pid"))?;
    let signal = sig.to_rustix();

    info!(pid, signal = ?sig, "delivering signal");

    if group_first {
        match rustix::process::kill_process_group(target, signal) {
            Ok(()) => return Ok(()),
            Err(err) => {
                info!(pid, %err, "failed to signal process group; trying the process");
            }
        }
    }

    if let Err(err) = rustix::process::kill_process(target, signal) {
        info!(pid, %err, "failed to signal process; sending SIGKILL");
        rustix::process::kill_process(target, rustix::process::Signal::Kill)
            .map_err(|e| Error::Io(e.into()))?;
    }

    Ok(())
}

/// Resizes the PTY while the command runs.
///
/// A no-op before start and after the master has been closed.
#[derive(Clone)]
pub struct WinsizeHandle {
    master: Arc<Mutex<Option<std::os::fd::OwnedFd>>>,
}

impl WinsizeHandle {
    pub(crate) fn new(master: Arc<Mutex<Option<std::os::fd::OwnedFd>>>) -> Self {
        Self { master }
    }

    /// Set the terminal window size
    pub fn set(&self, rows: u16, cols: u16) -> Result<(), Error> {
        let guard = self.master.lock().expect("winsize lock poisoned");
        match guard.as_ref() {
            Some(fd) => pty::set_winsize(fd.as_fd(), rows, cols).map_err(Error::Io),
            None => Ok(()),
        }
    }
}

/// Map an exit status to the wire exit code: the natural code for a normal
/// exit, `128 + signum` for a signal-terminated child.
pub fn exit_code(status: &ExitStatus) -> u32 {
    match status.code() {
        Some(code) => code as u32,
        None => 128 + status.signal().unwrap_or(0) as u32,
    }
}

/// Derive the child-exit error for an unsuccessful status, if any
pub fn exit_error(status: &ExitStatus) -> Option<Error> {
    if status.success() {
        return None;
    }
    match status.signal() {
        Some(sig) => Some(Error::child_exit(format!("signal: {}", signal_name(sig)))),
        None => Some(Error::child_exit(format!(
            "exit status {}",
            status.code().unwrap_or(-1)
        ))),
    }
}

fn signal_name(sig: i32) -> String {
    match sig {
        libc::SIGINT => "interrupt".to_string(),
        libc::SIGKILL => "killed".to_string(),
        libc::SIGTERM => "terminated".to_string(),
        libc::SIGHUP => "hangup".to_string(),
        other => format!("{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn exit_code_maps_signals_above_128() {
        let interrupted = ExitStatus::from_raw(libc::SIGINT);
        assert_eq!(exit_code(&interrupted), 130);

        let terminated = ExitStatus::from_raw(libc::SIGTERM);
        assert_eq!(exit_code(&terminated), 143);
    }

    #[test]
    fn exit_code_passes_normal_codes_through() {
        let ok = ExitStatus::from_raw(0);
        assert_eq!(exit_code(&ok), 0);

        let failed = ExitStatus::from_raw(11 << 8);
        assert_eq!(exit_code(&failed), 11);
    }

    #[test]
    fn exit_error_names_the_signal() {
        let interrupted = ExitStatus::from_raw(libc::SIGINT);
        let err = exit_error(&interrupted).unwrap();
        assert!(err.to_string().contains("signal: interrupt"));

        let failed = ExitStatus::from_raw(11 << 8);
        let err = exit_error(&failed).unwrap();
        assert!(err.to_string().contains("exit status 11"));

        let ok = ExitStatus::from_raw(0);
        assert!(exit_error(&ok).is_none());
    }

    #[test]
    fn signal_handle_refuses_before_start() {
        let handle = SignalHandle::new(Arc::new(AtomicU32::new(0)), false);
        assert!(handle.signal(CommandSignal::Interrupt).is_err());
    }

    #[test]
    fn winsize_handle_is_a_noop_without_a_master() {
        let handle = WinsizeHandle::new(Arc::new(Mutex::new(None)));
        handle.set(24, 80).unwrap();
    }
}
