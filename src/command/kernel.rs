//! Execution substrate abstraction
//!
//! A [`Kernel`] supplies everything about the environment a command runs in
//! that differs between substrates: program path resolution, the base
//! environment, and the expression used to dump a shell's environment after
//! execution. [`LocalKernel`] consults the host; a container-backed kernel
//! would consult an image's filesystem view instead.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::Error;

/// Abstraction over the environment commands execute in
pub trait Kernel: Send + Sync {
    /// Resolve a program name to an absolute path in the substrate's
    /// filesystem view.
    fn look_path(&self, name: &str) -> Result<PathBuf, Error>;

    /// Expression that, appended to a shell session and redirected to a
    /// file, writes `KEY=VALUE` records separated by NUL bytes.
    fn env_dump_command(&self) -> String {
        "env -0".to_string()
    }

    /// Base environment commands start from, before session and request
    /// entries are layered on top.
    fn base_env(&self) -> Vec<String>;

    /// Whether signals should target the child's process group first.
    fn signal_to_process_group(&self) -> bool;
}

/// Kernel executing programs directly on the host
pub struct LocalKernel {
    use_system_env: bool,
    signal_to_process_group: bool,
}

impl Default for LocalKernel {
    fn default() -> Self {
        Self {
            use_system_env: true,
            signal_to_process_group: true,
        }
    }
}

impl LocalKernel {
    /// Create a kernel with the default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle inheriting the server process environment
    pub fn with_system_env(mut self, use_system_env: bool) -> Self {
        self.use_system_env = use_system_env;
        self
    }

    /// Toggle group-first signal delivery.
    ///
    /// Tests disable this because their children are not group leaders.
    pub fn with_process_group_signals(mut self, enabled: bool) -> Self {
        self.signal_to_process_group = enabled;
        self
    }
}

impl Kernel for LocalKernel {
    fn look_path(&self, name: &str) -> Result<PathBuf, Error> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return if is_executable(candidate) {
                Ok(candidate.to_path_buf())
            } else {
                Err(Error::unresolved_program(format!(
                    "{name} is not an executable file"
                )))
            };
        }

        let path = std::env::var("PATH").unwrap_or_default();
        for dir in std::env::split_paths(&path) {
            let full = dir.join(name);
            if is_executable(&full) {
                return Ok(full);
            }
        }

        Err(Error::unresolved_program(format!("{name} not found in PATH")))
    }

    fn base_env(&self) -> Vec<String> {
        if !self.use_system_env {
            return Vec::new();
        }
        std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
    }

    fn signal_to_process_group(&self) -> bool {
        self.signal_to_process_group
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_path_resolves_shell_from_path() {
        let kernel = LocalKernel::new();
        let path = kernel.look_path("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn look_path_accepts_absolute_executable() {
        let kernel = LocalKernel::new();
        let sh = kernel.look_path("sh").unwrap();
        assert_eq!(kernel.look_path(sh.to_str().unwrap()).unwrap(), sh);
    }

    #[test]
    fn look_path_fails_for_unknown_program() {
        let kernel = LocalKernel::new();
        let err = kernel.look_path("definitely-not-a-real-program-xyz");
        assert!(matches!(err, Err(Error::UnresolvedProgram(_))));
    }

    #[test]
    fn env_dump_command_writes_nul_separated_records() {
        let kernel = LocalKernel::new();
        assert_eq!(kernel.env_dump_command(), "env -0");
    }

    #[test]
    fn base_env_respects_system_env_toggle() {
        let bare = LocalKernel::new().with_system_env(false);
        assert!(bare.base_env().is_empty());

        let system = LocalKernel::new();
        assert!(system.base_env().iter().any(|kv| kv.starts_with("PATH=")));
    }
}
