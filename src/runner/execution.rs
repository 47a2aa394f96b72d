//! Per-execution driver for the Execute stream
//!
//! One execution fans inbound stream messages (input, resize, stop) into a
//! running command and fans the command's output, MIME type and exit code
//! back as response events. The driver owns the command for the duration of
//! `wait`; the inbound loop acts through cloneable signal and winsize
//! handles instead of borrowing it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::normalizer::{is_shell_program, ENV_DUMP_FILE_VAR};
use crate::command::session::{diff_env, parse_env_dump, ANONYMOUS_CAPTURE_NAME};
use crate::command::{
    exit_code, exit_error, BoxedWriter, Command, CommandMode, CommandOptions, CommandSignal,
    CommandStdin, Kernel, ProgramConfig, Session, SignalHandle, WinsizeHandle,
};
use crate::error::Error;
use crate::proto::{ExecuteRequest, ExecuteResponse, ExecuteStop};
use crate::{INTERRUPT_KILL_GRACE, STDIN_CLOSE_GRACE};

const IO_BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 4096;

/// Outbound event channel for one execution
pub(crate) type EventSender = mpsc::Sender<Result<ExecuteResponse, Status>>;

/// A prepared execution: the command plus the handler-side stream endpoints
pub(crate) struct Execution {
    pub command: Command,
    pub session: Arc<Session>,
    pub store_stdout_in_env: bool,
    pub known_name: String,
    pub env_dump_path: PathBuf,
    pub stdin_writer: Option<DuplexStream>,
    pub stdout_reader: DuplexStream,
    pub stderr_reader: Option<DuplexStream>,
    pub stdin_seed: Option<String>,
}

impl Execution {
    /// Wire up the I/O endpoints and build the command for a configuration
    pub fn new(cfg: ProgramConfig, session: Arc<Session>, kernel: Arc<dyn Kernel>) -> Self {
        let interactive = cfg.interactive || cfg.mode == CommandMode::Terminal;
        let env_dump_path =
            std::env::temp_dir().join(format!("runlet-env-{}.dump", Uuid::new_v4()));

        let (stdin_writer, stdin_reader) = tokio::io::duplex(IO_BUFFER_SIZE);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(IO_BUFFER_SIZE);
        // The PTY merges stderr into the terminal stream, so only the pipe
        // substrate gets a dedicated stderr endpoint.
        let (stderr_writer, stderr_reader) = if interactive {
            (None, None)
        } else {
            let (writer, reader) = tokio::io::duplex(IO_BUFFER_SIZE);
            (Some(writer), Some(reader))
        };

        // Terminal mode has no script to carry the env-dump expression, so
        // the dump is installed as an exit trap over stdin instead.
        let stdin_seed = (cfg.mode == CommandMode::Terminal
            && is_shell_program(&cfg.program_name))
        .then(|| {
            format!(
                "trap '{} > \"{}\"' EXIT\n",
                kernel.env_dump_command(),
                env_dump_path.display()
            )
        });

        let store_stdout_in_env = cfg.store_stdout_in_env;
        let known_name = cfg.known_name.clone();

        let command = Command::new(
            cfg,
            CommandOptions {
                kernel,
                session: session.clone(),
                stdin: Some(CommandStdin::Reader(Box::new(stdin_reader))),
                stdout: Some(Box::new(stdout_writer)),
                stderr: stderr_writer.map(|writer| Box::new(writer) as BoxedWriter),
                env_dump_path: Some(env_dump_path.clone()),
            },
        );

        Self {
            command,
            session,
            store_stdout_in_env,
            known_name,
            env_dump_path,
            stdin_writer: Some(stdin_writer),
            stdout_reader,
            stderr_reader,
            stdin_seed,
        }
    }
}

/// Drive a started command to completion, emitting output and exit events.
///
/// Cancels `finished` once the command has been reaped so the inbound loop
/// can stop its shutdown escalation.
pub(crate) fn spawn_driver(
    mut execution: Execution,
    finished: CancellationToken,
    tx: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stdout_task = spawn_stdout_reader(
            execution.stdout_reader,
            tx.clone(),
            execution.store_stdout_in_env,
        );
        let stderr_task = execution
            .stderr_reader
            .map(|reader| spawn_stderr_reader(reader, tx.clone()));

        let wait_result = execution.command.wait().await;
        finished.cancel();

        // The pumps have shut their duplex halves by now; joining the
        // readers guarantees every output event precedes the exit event.
        let captured = stdout_task.await.unwrap_or_default();
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let exit_ok = execution
            .command
            .exit_status()
            .is_some_and(|status| status.success());

        apply_env_dump(
            &execution.session,
            execution.command.plan_env(),
            &execution.env_dump_path,
            exit_ok,
        )
        .await;

        if execution.store_stdout_in_env && exit_ok {
            store_captured_stdout(&execution.session, &execution.known_name, captured);
        }

        if let Some(status) = execution.command.exit_status() {
            let code = exit_code(&status);
            info!(code, "execution finished");
            let _ = tx
                .send(Ok(ExecuteResponse {
                    exit_code: Some(code),
                    ..Default::default()
                }))
                .await;
        }

        let error = match wait_result {
            Err(err) => Some(err),
            Ok(status) => exit_error(&status),
        };
        if let Some(err) = error {
            let _ = tx.send(Err(Status::from(err))).await;
        }
    })
}

/// Fan inbound requests into the running command.
///
/// On inbound EOF or transport error the child's stdin is closed; if the
/// command is still running after a grace period it is interrupted, then
/// after a further grace killed.
pub(crate) fn spawn_input_loop(
    mut inbound: Streaming<ExecuteRequest>,
    stdin_writer: DuplexStream,
    initial_input: Vec<u8>,
    stdin_seed: Option<String>,
    signal: SignalHandle,
    winsize: Option<WinsizeHandle>,
    finished: CancellationToken,
    tx: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdin_writer = Some(stdin_writer);

        if let Some(seed) = stdin_seed {
            write_stdin(&mut stdin_writer, seed.as_bytes()).await;
        }
        if !initial_input.is_empty() {
            write_stdin(&mut stdin_writer, &initial_input).await;
        }

        loop {
            tokio::select! {
                _ = finished.cancelled() => return,
                msg = inbound.next() => match msg {
                    Some(Ok(req)) => {
                        if is_configuration_request(&req) {
                            let err = Error::protocol(
                                "configuration is allowed only in the first request",
                            );
                            warn!(%err, "closing the stream");
                            let _ = tx.send(Err(Status::from(err))).await;
                            let _ = signal.signal(CommandSignal::Kill);
                            return;
                        }

                        if !req.input_data.is_empty() {
                            write_stdin(&mut stdin_writer, &req.input_data).await;
                        }

                        if let Some(ws) = req.winsize {
                            if let Some(handle) = &winsize {
                                if let Err(err) = handle.set(ws.rows as u16, ws.cols as u16) {
                                    warn!(%err, "failed to set terminal size");
                                }
                            }
                        }

                        match req.stop() {
                            ExecuteStop::Interrupt => {
                                if let Err(err) = signal.signal(CommandSignal::Interrupt) {
                                    warn!(%err, "failed to interrupt");
                                }
                            }
                            ExecuteStop::Kill => {
                                if let Err(err) = signal.signal(CommandSignal::Kill) {
                                    warn!(%err, "failed to kill");
                                }
                            }
                            ExecuteStop::Unspecified => {}
                        }
                    }
                    Some(Err(err)) => {
                        debug!(%err, "inbound stream error; treating as disconnect");
                        break;
                    }
                    None => break,
                },
            }
        }

        // Client half-closed: deliver EOF, then escalate while it still runs.
        drop(stdin_writer.take());
        tokio::select! {
            _ = finished.cancelled() => {}
            _ = tokio::time::sleep(STDIN_CLOSE_GRACE) => {
                debug!("stdin closed and command still running; interrupting");
                let _ = signal.signal(CommandSignal::Interrupt);
                tokio::select! {
                    _ = finished.cancelled() => {}
                    _ = tokio::time::sleep(INTERRUPT_KILL_GRACE) => {
                        debug!("command survived interrupt; killing");
                        let _ = signal.signal(CommandSignal::Kill);
                    }
                }
            }
        }
    })
}

async fn write_stdin(writer: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = writer.as_mut() {
        if let Err(err) = writer.write_all(data).await {
            debug!(%err, "failed to forward input");
        }
    }
}

fn is_configuration_request(req: &ExecuteRequest) -> bool {
    req.config.is_some()
        || !req.session_id.is_empty()
        || req.session_strategy != 0
        || req.store_stdout_in_env
}

fn spawn_stdout_reader(
    mut reader: DuplexStream,
    tx: EventSender,
    capture: bool,
) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut detector = crate::mime::OutputDetector::new();
        let mut captured = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = buf[..n].to_vec();
                    if capture {
                        captured.extend_from_slice(&data);
                    }
                    let mime_type = detector.observe(&data).unwrap_or_default();
                    let event = ExecuteResponse {
                        stdout_data: data,
                        mime_type,
                        ..Default::default()
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "stdout reader ended");
                    break;
                }
            }
        }
        if let Some(mime_type) = detector.finish() {
            let _ = tx
                .send(Ok(ExecuteResponse {
                    mime_type,
                    ..Default::default()
                }))
                .await;
        }
        captured
    })
}

fn spawn_stderr_reader(mut reader: DuplexStream, tx: EventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = ExecuteResponse {
                        stderr_data: buf[..n].to_vec(),
                        ..Default::default()
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "stderr reader ended");
                    break;
                }
            }
        }
    })
}

/// Read and remove the env-dump file, then apply the new bindings to the
/// session. Parse failures skip the session write without failing the RPC.
async fn apply_env_dump(session: &Session, plan_env: &[String], dump_path: &Path, exit_ok: bool) {
    let data = tokio::fs::read(dump_path).await;
    let _ = tokio::fs::remove_file(dump_path).await;

    if !exit_ok {
        return;
    }
    let Ok(data) = data else {
        // Nothing was dumped (non-shell program, or no trap installed).
        return;
    };

    let dumped = parse_env_dump(&data);
    let changed = diff_env(plan_env, &dumped, ENV_DUMP_FILE_VAR);
    if !changed.is_empty() {
        debug!(count = changed.len(), session = session.id(), "applying env delta");
        session.set_env(changed);
    }
}

fn store_captured_stdout(session: &Session, known_name: &str, mut captured: Vec<u8>) {
    if captured.ends_with(b"\n") {
        captured.pop();
        if captured.ends_with(b"\r") {
            captured.pop();
        }
    }
    let value = String::from_utf8_lossy(&captured).into_owned();
    session.put_known(ANONYMOUS_CAPTURE_NAME, &value);
    if !known_name.is_empty() {
        session.put_known(known_name, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_stdout_loses_one_trailing_newline() {
        let session = Session::new();
        store_captured_stdout(&session, "", b"test\n".to_vec());
        assert_eq!(session.get_env(), vec!["__=test"]);

        store_captured_stdout(&session, "", b"test\r\n".to_vec());
        assert_eq!(session.get_env(), vec!["__=test"]);

        // Only one newline is trimmed.
        store_captured_stdout(&session, "", b"test\n\n".to_vec());
        assert_eq!(session.get_env(), vec!["__=test\n"]);
    }

    #[test]
    fn captured_stdout_is_stored_under_the_known_name_too() {
        let session = Session::new();
        store_captured_stdout(&session, "MY_RESULT", b"value\n".to_vec());
        assert_eq!(session.get_env(), vec!["__=value", "MY_RESULT=value"]);
    }

    #[test]
    fn configuration_fields_are_first_request_only() {
        let req = ExecuteRequest {
            input_data: b"x".to_vec(),
            ..Default::default()
        };
        assert!(!is_configuration_request(&req));

        let req = ExecuteRequest {
            session_id: "abc".to_string(),
            ..Default::default()
        };
        assert!(is_configuration_request(&req));

        let req = ExecuteRequest {
            store_stdout_in_env: true,
            ..Default::default()
        };
        assert!(is_configuration_request(&req));
    }

    #[tokio::test]
    async fn env_dump_application_is_skipped_on_failure() {
        let session = Session::new();
        let dump = std::env::temp_dir().join(format!("runlet-test-{}.dump", Uuid::new_v4()));
        tokio::fs::write(&dump, b"NEW_VAR=1\0").await.unwrap();

        apply_env_dump(&session, &[], &dump, false).await;
        assert!(session.get_env().is_empty());
        // The dump file is consumed either way.
        assert!(!dump.exists());
    }

    #[tokio::test]
    async fn env_dump_applies_the_delta() {
        let session = Session::new();
        let dump = std::env::temp_dir().join(format!("runlet-test-{}.dump", Uuid::new_v4()));
        tokio::fs::write(&dump, b"KEPT=1\0NEW_VAR=2\0").await.unwrap();

        apply_env_dump(&session, &["KEPT=1".to_string()], &dump, true).await;
        assert_eq!(session.get_env(), vec!["NEW_VAR=2"]);
    }
}
