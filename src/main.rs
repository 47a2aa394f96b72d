//! runlet server - remote code-block execution over gRPC

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runlet::command::LocalKernel;
use runlet::runner::RunnerServer;

/// runlet - remote code-block execution service
#[derive(Parser, Debug)]
#[command(name = "runlet", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gRPC server (default mode)
    Server(ServerArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    /// gRPC server listen address
    #[arg(long, env = "RUNLET_ADDRESS", default_value = "127.0.0.1:50051")]
    address: SocketAddr,

    /// Do not seed executions from the server's own environment
    #[arg(long, env = "RUNLET_NO_SYSTEM_ENV")]
    no_system_env: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Server(args)) => run_server(args).await,
        None => {
            run_server(ServerArgs {
                address: ([127, 0, 0, 1], runlet::DEFAULT_GRPC_PORT).into(),
                no_system_env: false,
            })
            .await
        }
    }
}

/// Run the gRPC server until interrupted
async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    tracing::info!(address = %args.address, "runlet server starting...");

    let kernel = Arc::new(LocalKernel::new().with_system_env(!args.no_system_env));
    let server = RunnerServer::new(kernel);

    server
        .serve(args.address)
        .await
        .map_err(|e| anyhow::anyhow!("server failed: {e}"))?;

    Ok(())
}
