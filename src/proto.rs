//! gRPC protocol definitions for the runner service
//!
//! This module contains the generated Protobuf and gRPC code for the
//! bidirectional execution protocol.
//!
//! # Protocol Overview
//!
//! Clients open a bidirectional `Execute` stream where:
//!
//! - The first `ExecuteRequest` carries the `ProgramConfig` plus optional
//!   session selection, initial input and terminal size.
//! - Subsequent requests carry `input_data`, `winsize` or `stop` events.
//! - Responses carry, in order: one pid event, any number of
//!   stdout/stderr/MIME-type events, and exactly one terminal exit-code
//!   event.
//!
//! # Example
//!
//! ```ignore
//! use runlet::proto::runner_service_client::RunnerServiceClient;
//!
//! let mut client = RunnerServiceClient::connect("http://127.0.0.1:50051").await?;
//!
//! let (tx, rx) = mpsc::channel(32);
//! let response = client.execute(ReceiverStream::new(rx)).await?;
//! let mut inbound = response.into_inner();
//!
//! tx.send(ExecuteRequest { config: Some(config), ..Default::default() }).await?;
//!
//! while let Some(event) = inbound.message().await? {
//!     handle_event(event);
//! }
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for the runner protocol
pub mod runner {
    /// Version 1 of the runner protocol
    pub mod v1 {
        tonic::include_proto!("runlet.runner.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use runner::v1::*;
