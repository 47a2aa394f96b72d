//! Error types for the runlet service

use thiserror::Error;

/// Main error type for runlet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or under-specified program configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The program could not be resolved to an executable path
    #[error("unresolved program: {0}")]
    UnresolvedProgram(String),

    /// The command could not be started (PTY open, spawn, fd duplication)
    #[error("startup error: {0}")]
    Startup(String),

    /// I/O failure while pumping data to or from the child
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The child terminated unsuccessfully
    #[error("child exit error: {0}")]
    ChildExit(String),

    /// One or more deferred cleanups failed
    #[error("cleanup error: {0}")]
    Cleanup(String),

    /// A stream message arrived in the wrong state
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unresolved-program error with the given message
    pub fn unresolved_program(msg: impl Into<String>) -> Self {
        Self::UnresolvedProgram(msg.into())
    }

    /// Create a startup error with the given message
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a child-exit error with the given message
    pub fn child_exit(msg: impl Into<String>) -> Self {
        Self::ChildExit(msg.into())
    }

    /// Create a cleanup error with the given message
    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    /// Create a protocol error with the given message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Aggregate multiple errors into one, preserving each message.
    ///
    /// Returns `None` when the input contains no errors.
    pub fn aggregate(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut errors = errors.into_iter().collect::<Vec<_>>();
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Some(Error::Cleanup(joined))
            }
        }
    }
}

impl From<&Error> for tonic::Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::Config(_) | Error::UnresolvedProgram(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            Error::Protocol(_) => tonic::Status::failed_precondition(err.to_string()),
            Error::Startup(_) => tonic::Status::internal(err.to_string()),
            _ => tonic::Status::unknown(err.to_string()),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        (&err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: configuration errors reject the request before anything runs
    ///
    /// When a client submits a config with no source and no program, the
    /// request fails with InvalidArgument and no process is spawned.
    #[test]
    fn story_config_errors_map_to_invalid_argument() {
        let err = Error::config("neither commands nor script provided");
        assert!(err.to_string().contains("configuration error"));

        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let err = Error::unresolved_program("no interpreter found for language \"py\"");
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    /// Story: protocol violations get a distinct status
    ///
    /// Sending a second Config on an already-configured stream must be
    /// distinguishable from a bad config.
    #[test]
    fn story_protocol_errors_map_to_failed_precondition() {
        let err = Error::protocol("config already received");
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    /// Story: startup failures are server-side faults
    #[test]
    fn story_startup_errors_map_to_internal() {
        let err = Error::startup("failed to open pty pair");
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    /// Story: post-start failures surface as Unknown after the exit event
    #[test]
    fn story_child_exit_errors_map_to_unknown() {
        let err = Error::child_exit("signal: interrupt");
        assert!(err.to_string().contains("interrupt"));
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), tonic::Code::Unknown);
    }

    #[test]
    fn aggregate_none_for_empty() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_passes_single_error_through() {
        let err = Error::aggregate(vec![Error::child_exit("exit status 11")]).unwrap();
        match err {
            Error::ChildExit(msg) => assert_eq!(msg, "exit status 11"),
            other => panic!("expected ChildExit, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_joins_messages() {
        let err = Error::aggregate(vec![
            Error::cleanup("failed to remove script file"),
            Error::Io(std::io::Error::other("broken pipe")),
        ])
        .unwrap();
        let msg = err.to_string();
        assert!(msg.contains("failed to remove script file"));
        assert!(msg.contains("broken pipe"));
    }
}
