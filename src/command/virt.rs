//! PTY-substrate command execution
//!
//! The child is attached to a freshly opened pseudo-terminal pair and made
//! the session leader of its own process group, with the slave as its
//! controlling terminal. Two pumps move bytes between the caller's
//! endpoints and the PTY master; the master is released only after both
//! pumps have terminated.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::config::ProgramConfig;
use crate::command::native::{run_cleanups, set_once};
use crate::command::normalizer::{
    normalize_config, ArgsNormalizer, CleanupFn, EnvNormalizer, ModeNormalizer, PathNormalizer,
};
use crate::command::pty::{disable_echo, PtyPair};
use crate::command::{BoxedReader, CommandOptions, CommandStdin, SignalHandle, WinsizeHandle};
use crate::error::Error;

/// Executes a child process attached to a pseudo-terminal
pub struct VirtualCommand {
    cfg: ProgramConfig,
    opts: CommandOptions,

    // Populated when the command is started.
    child: Option<tokio::process::Child>,
    pid: Arc<AtomicU32>,
    master: Arc<Mutex<Option<OwnedFd>>>,
    slave: Option<OwnedFd>,
    pumps: Vec<JoinHandle<()>>,
    pump_error: Arc<Mutex<Option<Error>>>,
    stdin_cancel: CancellationToken,
    cleanups: Vec<CleanupFn>,
    exit_status: Option<ExitStatus>,
    plan_env: Vec<String>,
}

impl VirtualCommand {
    /// Create a command; nothing runs until [`VirtualCommand::start`]
    pub fn new(cfg: ProgramConfig, opts: CommandOptions) -> Self {
        Self {
            cfg,
            opts,
            child: None,
            pid: Arc::new(AtomicU32::new(0)),
            master: Arc::new(Mutex::new(None)),
            slave: None,
            pumps: Vec::new(),
            pump_error: Arc::new(Mutex::new(None)),
            stdin_cancel: CancellationToken::new(),
            cleanups: Vec::new(),
            exit_status: None,
            plan_env: Vec::new(),
        }
    }

    /// The fully materialized environment of the executed plan
    pub fn plan_env(&self) -> &[String] {
        &self.plan_env
    }

    /// Child pid, once started
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether the child has started and not yet been reaped
    pub fn running(&self) -> bool {
        self.child.is_some() && self.exit_status.is_none()
    }

    /// Exit status observed by [`VirtualCommand::wait`]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Handle for delivering signals.
    ///
    /// The child leads its own session, so the group is always tried first.
    pub fn signal_handle(&self) -> SignalHandle {
        SignalHandle::new(self.pid.clone(), true)
    }

    /// Handle for resizing the terminal while the command runs
    pub fn winsize_handle(&self) -> WinsizeHandle {
        WinsizeHandle::new(self.master.clone())
    }

    /// Normalize the configuration, open the PTY pair and spawn the child
    pub async fn start(&mut self) -> Result<(), Error> {
        let kernel = self.opts.kernel.clone();
        let session_env = self.opts.session.get_env();
        let dump_path = self.opts.env_dump_path.clone();

        let (cfg, cleanups) = normalize_config(
            self.cfg.clone(),
            &[
                &PathNormalizer::new(kernel.as_ref()),
                &ModeNormalizer,
                &ArgsNormalizer::new(kernel.as_ref(), dump_path.as_deref()),
                &EnvNormalizer::new(kernel.as_ref(), session_env, dump_path.as_deref()),
            ],
        )?;
        self.cleanups.extend(cleanups);
        self.plan_env = cfg.env.clone();

        let pair = PtyPair::open().map_err(|e| Error::startup(format!("failed to open pty: {e}")))?;
        disable_echo(pair.slave.as_fd())
            .map_err(|e| Error::startup(format!("failed to disable echo: {e}")))?;

        let dup_slave = |pair: &PtyPair| -> Result<OwnedFd, Error> {
            pair.slave
                .try_clone()
                .map_err(|e| Error::startup(format!("failed to dup tty: {e}")))
        };

        let mut cmd = tokio::process::Command::new(&cfg.program_name);
        cmd.args(&cfg.arguments);
        cmd.env_clear();
        cmd.envs(cfg.env.iter().filter_map(|pair| pair.split_once('=')));
        if !cfg.directory.is_empty() {
            cmd.current_dir(&cfg.directory);
        }
        cmd.stdin(Stdio::from(dup_slave(&pair)?));
        cmd.stdout(Stdio::from(dup_slave(&pair)?));
        cmd.stderr(Stdio::from(dup_slave(&pair)?));
        cmd.kill_on_drop(true);

        // The child becomes a session leader with the slave (its fd 0) as
        // the controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        info!(program = %cfg.program_name, args = ?cfg.arguments, "starting a virtual command");

        let child = cmd
            .spawn()
            .map_err(|e| Error::startup(format!("failed to spawn {}: {e}", cfg.program_name)))?;
        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
        self.child = Some(child);

        let master_writer = pair
            .master
            .try_clone()
            .map_err(|e| Error::startup(format!("failed to dup pty master: {e}")))?;
        let master_reader = pair
            .master
            .try_clone()
            .map_err(|e| Error::startup(format!("failed to dup pty master: {e}")))?;
        *self.master.lock().expect("master lock poisoned") = Some(pair.master);
        self.slave = Some(pair.slave);

        let stdin = self.opts.stdin.take().map(|stdin| match stdin {
            CommandStdin::Reader(reader) => reader,
            CommandStdin::File(file) => {
                Box::new(tokio::fs::File::from_std(file)) as BoxedReader
            }
        });

        if let Some(mut reader) = stdin {
            let mut master = tokio::fs::File::from_std(std::fs::File::from(master_writer));
            let cancel = self.stdin_cancel.clone();
            let slot = self.pump_error.clone();
            self.pumps.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        // Cancellation abandons an in-flight read; any bytes
                        // it would have produced are discarded.
                        _ = cancel.cancelled() => break,
                        result = reader.read(&mut buf) => match result {
                            Ok(0) => break,
                            Ok(n) => {
                                if let Err(err) = master.write_all(&buf[..n]).await {
                                    set_once(&slot, Error::Io(err));
                                    break;
                                }
                            }
                            Err(err) => {
                                set_once(&slot, Error::Io(err));
                                break;
                            }
                        },
                    }
                }
                debug!("finished copying from stdin to pty");
            }));
        }

        // Without a sink the child would fill the pty buffer and stall, so
        // output is always drained.
        let mut writer = self
            .opts
            .stdout
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::sink()));
        let slot = self.pump_error.clone();
        self.pumps.push(tokio::spawn(async move {
            let mut master = tokio::fs::File::from_std(std::fs::File::from(master_reader));
            let mut buf = vec![0u8; 4096];
            loop {
                match master.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(err) = writer.write_all(&buf[..n]).await {
                            set_once(&slot, Error::Io(err));
                            break;
                        }
                    }
                    // The kernel reports EIO on a master whose slave side
                    // has fully closed; that is a clean end of stream.
                    Err(err) if err.raw_os_error() == Some(libc::EIO) => {
                        debug!("pty master read ended; handled EIO");
                        break;
                    }
                    Err(err) => {
                        set_once(&slot, Error::Io(err));
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
            debug!("finished copying from pty to stdout");
        }));

        info!("a virtual command started");

        Ok(())
    }

    /// Reap the child, close the slave, join the pumps, then release the
    /// master and run cleanups, aggregating errors.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::startup("command has not started"))?;

        info!("waiting for the virtual command to finish");

        let status = child.wait().await.map_err(Error::Io)?;
        self.exit_status = Some(status);

        // Unblock the stdin pump, then close the slave so the output pump's
        // master reads hit EOF/EIO once drained.
        self.stdin_cancel.cancel();
        drop(self.slave.take());

        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }

        // The master must outlive the pumps; release it only after the join.
        drop(self.master.lock().expect("master lock poisoned").take());

        let mut errors = Vec::new();
        if let Some(err) = self.pump_error.lock().expect("pump error lock poisoned").take() {
            errors.push(err);
        }
        errors.extend(run_cleanups(&mut self.cleanups));

        info!(code = ?status.code(), "the virtual command finished");

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }
}
