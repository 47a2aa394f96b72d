//! Program configuration model
//!
//! [`ProgramConfig`] is the domain-side view of the wire `ProgramConfig`,
//! immutable per execution. The normalizer pipeline consumes one and
//! produces the executable plan.

use crate::error::Error;
use crate::proto;

/// How the program source is turned into an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandMode {
    /// No mode requested; normalizes to [`CommandMode::Inline`]
    #[default]
    Unspecified,
    /// Source is materialized into arguments before launch
    Inline,
    /// The program is launched as-is and driven via stdin
    Terminal,
}

/// Program source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Lines joined with newlines before execution
    Commands(Vec<String>),
    /// A complete script
    Script(String),
}

impl Source {
    /// The source as a single script string
    pub fn to_script(&self) -> String {
        match self {
            Source::Commands(lines) => lines.join("\n"),
            Source::Script(script) => script.clone(),
        }
    }
}

/// A single execution's configuration
#[derive(Debug, Clone, Default)]
pub struct ProgramConfig {
    /// Program to execute; empty means infer from `language_id`
    pub program_name: String,
    /// Arguments, preceding any synthesized ones
    pub arguments: Vec<String>,
    /// Working directory; empty inherits the server's
    pub directory: String,
    /// Language hint for interpreter resolution
    pub language_id: String,
    /// Program source, if any
    pub source: Option<Source>,
    /// Request environment in `KEY=VALUE` form
    pub env: Vec<String>,
    /// Attach to a pseudo-terminal
    pub interactive: bool,
    /// Source materialization mode
    pub mode: CommandMode,
    /// Session variable receiving the execution's stdout
    pub known_name: String,
    /// Store stdout in the session environment
    pub store_stdout_in_env: bool,
}

impl ProgramConfig {
    /// Build a domain config from the wire type.
    ///
    /// Fails when neither a program nor a way to infer one is present.
    pub fn from_proto(config: proto::ProgramConfig) -> Result<Self, Error> {
        let source = match config.source {
            Some(proto::program_config::Source::Commands(list)) => {
                Some(Source::Commands(list.items))
            }
            Some(proto::program_config::Source::Script(script)) => Some(Source::Script(script)),
            None => None,
        };

        let mode = match proto::CommandMode::try_from(config.mode) {
            Ok(proto::CommandMode::Inline) => CommandMode::Inline,
            Ok(proto::CommandMode::Terminal) => CommandMode::Terminal,
            _ => CommandMode::Unspecified,
        };

        let cfg = Self {
            program_name: config.program_name,
            arguments: config.arguments,
            directory: config.directory,
            language_id: config.language_id,
            source,
            env: config.env,
            interactive: config.interactive,
            mode,
            known_name: config.known_name,
            store_stdout_in_env: false,
        };

        if cfg.program_name.is_empty() && cfg.language_id.is_empty() {
            return Err(Error::config(
                "neither a program name nor a language id was provided",
            ));
        }

        Ok(cfg)
    }
}
