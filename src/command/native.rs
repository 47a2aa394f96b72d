//! Pipe-substrate command execution

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::config::ProgramConfig;
use crate::command::normalizer::{
    normalize_config, ArgsNormalizer, CleanupFn, EnvNormalizer, ModeNormalizer, PathNormalizer,
};
use crate::command::{CommandOptions, CommandStdin, SignalHandle};
use crate::error::Error;

/// Executes a child process with pipe-attached standard streams.
///
/// The child is not placed in a new process group; some interactive
/// programs misbehave when moved out of the session's foreground group, and
/// controlling-terminal semantics belong to the PTY substrate.
pub struct NativeCommand {
    cfg: ProgramConfig,
    opts: CommandOptions,

    // Populated when the command is started.
    child: Option<tokio::process::Child>,
    pid: Arc<AtomicU32>,
    pumps: Vec<JoinHandle<()>>,
    pump_error: Arc<Mutex<Option<Error>>>,
    stdin_cancel: CancellationToken,
    cleanups: Vec<CleanupFn>,
    exit_status: Option<ExitStatus>,
    plan_env: Vec<String>,
}

impl NativeCommand {
    /// Create a command; nothing runs until [`NativeCommand::start`]
    pub fn new(cfg: ProgramConfig, opts: CommandOptions) -> Self {
        Self {
            cfg,
            opts,
            child: None,
            pid: Arc::new(AtomicU32::new(0)),
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

    /// Exit status observed by [`NativeCommand::wait`]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Handle for delivering signals; group-first when the kernel says so
    pub fn signal_handle(&self) -> SignalHandle {
        SignalHandle::new(
            self.pid.clone(),
            self.opts.kernel.signal_to_process_group(),
        )
    }

    /// Normalize the configuration and spawn the child
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

        let mut cmd = tokio::process::Command::new(&cfg.program_name);
        cmd.args(&cfg.arguments);
        cmd.env_clear();
        cmd.envs(cfg.env.iter().filter_map(|pair| pair.split_once('=')));
        if !cfg.directory.is_empty() {
            cmd.current_dir(&cfg.directory);
        }
        cmd.kill_on_drop(true);

        let mut stdin_reader = None;
        match self.opts.stdin.take() {
            Some(CommandStdin::File(file)) => {
                // try_clone duplicates the descriptor with close-on-exec, so
                // the caller keeps its own copy intact.
                let dup = file
                    .try_clone()
                    .map_err(|e| Error::startup(format!("failed to dup stdin: {e}")))?;
                cmd.stdin(Stdio::from(dup));
            }
            Some(CommandStdin::Reader(reader)) => {
                cmd.stdin(Stdio::piped());
                stdin_reader = Some(reader);
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(if self.opts.stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if self.opts.stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        info!(program = %cfg.program_name, args = ?cfg.arguments, "starting a native command");

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::startup(format!("failed to spawn {}: {e}", cfg.program_name)))?;
        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);

        if let Some(mut reader) = stdin_reader {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::startup("child stdin pipe missing"))?;
            let cancel = self.stdin_cancel.clone();
            self.pumps.push(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = tokio::io::copy(&mut reader, &mut child_stdin) => {
                        // A broken pipe just means the child stopped reading.
                        if let Err(err) = result {
                            debug!(%err, "stdin copy ended");
                        }
                    }
                }
                // Dropping the handle closes the pipe, delivering EOF.
            }));
        }

        if let Some(mut writer) = self.opts.stdout.take() {
            let mut child_stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::startup("child stdout pipe missing"))?;
            let slot = self.pump_error.clone();
            self.pumps.push(tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut child_stdout, &mut writer).await {
                    set_once(&slot, Error::Io(err));
                }
                let _ = writer.shutdown().await;
            }));
        }

        if let Some(mut writer) = self.opts.stderr.take() {
            let mut child_stderr = child
                .stderr
                .take()
                .ok_or_else(|| Error::startup("child stderr pipe missing"))?;
            let slot = self.pump_error.clone();
            self.pumps.push(tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut child_stderr, &mut writer).await {
                    set_once(&slot, Error::Io(err));
                }
                let _ = writer.shutdown().await;
            }));
        }

        self.child = Some(child);

        info!("a native command started");

        Ok(())
    }

    /// Reap the child, join the pumps and run cleanups in registration
    /// order, aggregating their errors.
    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::startup("command has not started"))?;

        info!("waiting for the native command to finish");

        let status = child.wait().await.map_err(Error::Io)?;
        self.exit_status = Some(status);

        // Unblock a stdin pump still waiting on the caller's reader; output
        // pumps drain to EOF on their own once the child exits.
        self.stdin_cancel.cancel();
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }

        let mut errors = Vec::new();
        if let Some(err) = self.pump_error.lock().expect("pump error lock poisoned").take() {
            errors.push(err);
        }
        errors.extend(run_cleanups(&mut self.cleanups));

        info!(code = ?status.code(), "the native command finished");

        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }
}

pub(crate) fn set_once(slot: &Arc<Mutex<Option<Error>>>, err: Error) {
    let mut guard = slot.lock().expect("error slot lock poisoned");
    if guard.is_none() {
        *guard = Some(err);
    }
}

pub(crate) fn run_cleanups(cleanups: &mut Vec<CleanupFn>) -> Vec<Error> {
    cleanups
        .drain(..)
        .filter_map(|cleanup| {
            cleanup()
                .err()
                .map(|e| Error::cleanup(format!("deferred cleanup failed: {e}")))
        })
        .collect()
}
