//! gRPC runner service
//!
//! Exposes the bidirectional `Execute` stream and the `CreateSession` RPC.
//! Each execution resolves a session, normalizes the submitted program
//! configuration, starts a command under the selected substrate and streams
//! lifecycle events back to the client.

mod execution;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument};

use crate::command::{Kernel, LocalKernel, ProgramConfig, SessionStore};
use crate::error::Error;
use crate::proto::runner_service_server::{RunnerService, RunnerServiceServer};
use crate::proto::{
    CreateSessionRequest, CreateSessionResponse, ExecuteRequest, ExecuteResponse, SessionStrategy,
};

use execution::{spawn_driver, spawn_input_loop, Execution};

static OPINIONATED_ENV_VAR_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]{2,}$").expect("invalid naming regex"));

/// Whether a name may be used as a session variable: uppercase start,
/// minimum length three, uppercase letters, digits and underscores only.
pub fn conforms_opinionated_env_var_naming(name: &str) -> bool {
    OPINIONATED_ENV_VAR_NAME.is_match(name)
}

/// gRPC server for program execution
pub struct RunnerServer {
    kernel: Arc<dyn Kernel>,
    sessions: Arc<SessionStore>,
}

impl RunnerServer {
    /// Create a runner backed by the given kernel
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            sessions: Arc::new(SessionStore::new()),
        }
    }

    /// Create a runner executing directly on the host
    pub fn with_local_kernel() -> Self {
        Self::new(Arc::new(LocalKernel::new()))
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> RunnerServiceServer<Self> {
        RunnerServiceServer::new(self)
    }

    /// Start the gRPC server on the given address.
    ///
    /// This is the primary entry point for running the service.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
        info!(%addr, "starting the runner gRPC server");

        Server::builder()
            .add_service(self.into_service())
            .serve(addr)
            .await?;

        Ok(())
    }
}

#[tonic::async_trait]
impl RunnerService for RunnerServer {
    type ExecuteStream =
        Pin<Box<dyn Stream<Item = Result<ExecuteResponse, Status>> + Send + 'static>>;

    #[instrument(skip(self, request))]
    async fn execute(
        &self,
        request: Request<Streaming<ExecuteRequest>>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let mut inbound = request.into_inner();

        let first = match inbound.next().await {
            Some(Ok(req)) => req,
            Some(Err(status)) => return Err(status),
            None => {
                return Err(Error::protocol("the stream ended before a configuration arrived")
                    .into())
            }
        };

        let session = if !first.session_id.is_empty() {
            self.sessions.get(&first.session_id).ok_or_else(|| {
                Status::not_found(format!("session {} not found", first.session_id))
            })?
        } else if first.session_strategy() == SessionStrategy::MostRecent {
            self.sessions.most_recent_or_create()
        } else {
            self.sessions.create()
        };

        let Some(config) = first.config else {
            return Err(Error::protocol("the first request must carry a configuration").into());
        };

        let mut cfg = ProgramConfig::from_proto(config)?;
        cfg.store_stdout_in_env = first.store_stdout_in_env;
        if !cfg.known_name.is_empty() && !conforms_opinionated_env_var_naming(&cfg.known_name) {
            return Err(Error::config(format!(
                "known name {:?} does not conform to the naming rule",
                cfg.known_name
            ))
            .into());
        }

        info!(
            session = session.id(),
            program = %cfg.program_name,
            interactive = cfg.interactive,
            "starting execution"
        );

        let mut execution = Execution::new(cfg, session, self.kernel.clone());
        execution.command.start().await?;

        let (tx, rx) = mpsc::channel::<Result<ExecuteResponse, Status>>(32);

        // The pid event precedes every output event.
        let pid = execution.command.pid().unwrap_or_default();
        let _ = tx
            .send(Ok(ExecuteResponse {
                pid: Some(pid),
                ..Default::default()
            }))
            .await;

        if let Some(ws) = first.winsize {
            if let Some(handle) = execution.command.winsize_handle() {
                if let Err(err) = handle.set(ws.rows as u16, ws.cols as u16) {
                    tracing::warn!(%err, "failed to set the initial terminal size");
                }
            }
        }

        let finished = CancellationToken::new();
        let stdin_writer = execution
            .stdin_writer
            .take()
            .expect("stdin writer consumed before the input loop");
        let stdin_seed = execution.stdin_seed.take();

        let _ = spawn_input_loop(
            inbound,
            stdin_writer,
            first.input_data,
            stdin_seed,
            execution.command.signal_handle(),
            execution.command.winsize_handle(),
            finished.clone(),
            tx.clone(),
        );
        let _ = spawn_driver(execution, finished, tx);

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    #[instrument(skip(self, _request))]
    async fn create_session(
        &self,
        _request: Request<CreateSessionRequest>,
    ) -> Result<Response<CreateSessionResponse>, Status> {
        let session = self.sessions.create();
        info!(session = session.id(), "created session");

        Ok(Response::new(CreateSessionResponse {
            session: Some(crate::proto::Session {
                id: session.id().to_string(),
            }),
        }))
    }
}
