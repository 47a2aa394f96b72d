//! runlet - remote code-block execution service
//!
//! runlet exposes a bidirectional streaming gRPC endpoint that accepts
//! program configurations, launches processes under one of two execution
//! substrates, forwards standard input/output/error in both directions, and
//! returns structured lifecycle events (pid, output chunks, detected output
//! MIME type, exit code). Per-session environment state lets consecutive
//! executions share and mutate shell variables.
//!
//! # Architecture
//!
//! An execution flows through four stages:
//! - the submitted configuration is normalized into an executable plan
//!   (program resolution, mode selection, source materialization,
//!   environment assembly);
//! - a command runs the plan under the pipe substrate or, for interactive
//!   and terminal executions, under a pseudo-terminal;
//! - the stream handler fans input, resize and stop events into the running
//!   command and fans output and lifecycle events back;
//! - after termination, the child's final environment is diffed into the
//!   session so the next execution sees exported variables.
//!
//! # Modules
//!
//! - [`command`] - Execution substrates, config normalization, sessions
//! - [`runner`] - The gRPC service (`Execute`, `CreateSession`)
//! - [`proto`] - Generated protocol definitions
//! - [`mime`] - Streaming stdout MIME detection
//! - [`error`] - Error types for the service

#![deny(missing_docs)]

pub mod command;
pub mod error;
pub mod mime;
pub mod proto;
pub mod runner;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the runner gRPC server
pub const DEFAULT_GRPC_PORT: u16 = 50051;

/// How long after the client closes its send direction a still-running
/// child is allowed before it is interrupted
pub const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long an interrupted child is allowed before it is killed
pub const INTERRUPT_KILL_GRACE: Duration = Duration::from_secs(5);
