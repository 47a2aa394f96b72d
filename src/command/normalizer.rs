//! Config normalization pipeline
//!
//! Turns a submitted [`ProgramConfig`] into an executable plan through a
//! fixed sequence of transforms: path resolution, mode selection, source
//! materialization, environment assembly. Each transform may register
//! cleanup callbacks that the command runs after wait, regardless of the
//! execution's outcome. Normalizers never start processes.

use std::io::Write;
use std::path::Path;

use crate::command::config::{CommandMode, ProgramConfig};
use crate::command::kernel::Kernel;
use crate::command::session;
use crate::error::Error;

/// Synthetic environment variable carrying the env-dump output path.
pub const ENV_DUMP_FILE_VAR: &str = "RUNLET_ENV_DUMP_FILE";

/// Deferred cleanup registered during normalization, run after wait.
pub type CleanupFn = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// A single transform over the configuration
pub trait Normalizer {
    /// Produce the next configuration, optionally registering cleanups.
    fn normalize(
        &self,
        cfg: ProgramConfig,
        cleanups: &mut Vec<CleanupFn>,
    ) -> Result<ProgramConfig, Error>;
}

/// Apply normalizers in order, collecting their cleanups.
///
/// On error, cleanups registered so far are run immediately.
pub fn normalize_config(
    mut cfg: ProgramConfig,
    normalizers: &[&dyn Normalizer],
) -> Result<(ProgramConfig, Vec<CleanupFn>), Error> {
    let mut cleanups = Vec::new();
    for normalizer in normalizers {
        match normalizer.normalize(cfg, &mut cleanups) {
            Ok(next) => cfg = next,
            Err(err) => {
                for cleanup in cleanups {
                    let _ = cleanup();
                }
                return Err(err);
            }
        }
    }
    Ok((cfg, cleanups))
}

/// Interpreter candidates per language id; the first candidate resolvable
/// on the kernel's PATH wins.
const LANGUAGE_INTERPRETERS: &[(&str, &[&str])] = &[
    ("bash", &["bash"]),
    ("js", &["node"]),
    ("py", &["python3", "python"]),
    ("sh", &["bash", "sh"]),
];

const SHELLS: &[&str] = &["bash", "sh", "zsh", "ksh", "dash"];

/// Whether the resolved program is a shell, and thus can evaluate an
/// appended env-dump expression.
pub fn is_shell_program(program: &str) -> bool {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| SHELLS.contains(&name))
}

/// Resolves the program to an absolute path
pub struct PathNormalizer<'a> {
    kernel: &'a dyn Kernel,
}

impl<'a> PathNormalizer<'a> {
    /// Create a path normalizer backed by the given kernel
    pub fn new(kernel: &'a dyn Kernel) -> Self {
        Self { kernel }
    }
}

impl Normalizer for PathNormalizer<'_> {
    fn normalize(
        &self,
        mut cfg: ProgramConfig,
        _cleanups: &mut Vec<CleanupFn>,
    ) -> Result<ProgramConfig, Error> {
        if cfg.program_name.is_empty() {
            let candidates = LANGUAGE_INTERPRETERS
                .iter()
                .find(|(lang, _)| *lang == cfg.language_id)
                .map(|(_, candidates)| *candidates)
                .ok_or_else(|| {
                    Error::unresolved_program(format!(
                        "no interpreter known for language {:?}",
                        cfg.language_id
                    ))
                })?;

            let resolved = candidates
                .iter()
                .find_map(|candidate| self.kernel.look_path(candidate).ok())
                .ok_or_else(|| {
                    Error::unresolved_program(format!(
                        "no interpreter for language {:?} found in PATH",
                        cfg.language_id
                    ))
                })?;

            cfg.program_name = resolved.to_string_lossy().into_owned();
            return Ok(cfg);
        }

        if !Path::new(&cfg.program_name).is_absolute() {
            let resolved = self.kernel.look_path(&cfg.program_name)?;
            cfg.program_name = resolved.to_string_lossy().into_owned();
        }

        Ok(cfg)
    }
}

/// Defaults the mode and enforces terminal-mode implications
pub struct ModeNormalizer;

impl Normalizer for ModeNormalizer {
    fn normalize(
        &self,
        mut cfg: ProgramConfig,
        _cleanups: &mut Vec<CleanupFn>,
    ) -> Result<ProgramConfig, Error> {
        if cfg.mode == CommandMode::Unspecified {
            cfg.mode = CommandMode::Inline;
        }
        if cfg.mode == CommandMode::Terminal {
            cfg.interactive = true;
        }
        Ok(cfg)
    }
}

/// Materializes the source into arguments
pub struct ArgsNormalizer<'a> {
    kernel: &'a dyn Kernel,
    env_dump_path: Option<&'a Path>,
}

impl<'a> ArgsNormalizer<'a> {
    /// Create an args normalizer; `env_dump_path`, when set and the program
    /// is a shell, arranges the post-execution environment dump.
    pub fn new(kernel: &'a dyn Kernel, env_dump_path: Option<&'a Path>) -> Self {
        Self {
            kernel,
            env_dump_path,
        }
    }

    fn script_suffix(cfg: &ProgramConfig) -> &'static str {
        if is_shell_program(&cfg.program_name) {
            return ".sh";
        }
        match cfg.language_id.as_str() {
            "py" => ".py",
            "js" => ".js",
            _ => "",
        }
    }
}

impl Normalizer for ArgsNormalizer<'_> {
    fn normalize(
        &self,
        mut cfg: ProgramConfig,
        cleanups: &mut Vec<CleanupFn>,
    ) -> Result<ProgramConfig, Error> {
        // Terminal mode launches the program bare; the session is driven
        // over stdin instead of a materialized script.
        if cfg.mode == CommandMode::Terminal {
            cfg.source = None;
            return Ok(cfg);
        }

        let Some(source) = cfg.source.take() else {
            return Ok(cfg);
        };

        let mut script = String::new();
        if let Some(dump_path) = self.env_dump_path {
            if is_shell_program(&cfg.program_name) {
                // An exit trap preserves the user script's exit code and
                // still dumps the final environment.
                script.push_str(&format!(
                    "trap '{} > \"{}\"' EXIT\n",
                    self.kernel.env_dump_command(),
                    dump_path.display()
                ));
            }
        }
        script.push_str(&source.to_script());
        script.push('\n');

        let mut file = tempfile::Builder::new()
            .prefix("runlet-script-")
            .suffix(Self::script_suffix(&cfg))
            .tempfile()
            .map_err(|e| Error::startup(format!("failed to create script file: {e}")))?;
        file.write_all(script.as_bytes())
            .map_err(|e| Error::startup(format!("failed to write script file: {e}")))?;

        let (_, path) = file
            .keep()
            .map_err(|e| Error::startup(format!("failed to persist script file: {e}")))?;

        // Caller-provided arguments precede the synthesized script path.
        cfg.arguments.push(path.to_string_lossy().into_owned());

        cleanups.push(Box::new(move || std::fs::remove_file(&path)));

        Ok(cfg)
    }
}

/// Assembles the fully materialized environment
pub struct EnvNormalizer<'a> {
    kernel: &'a dyn Kernel,
    session_env: Vec<String>,
    env_dump_path: Option<&'a Path>,
}

impl<'a> EnvNormalizer<'a> {
    /// Create an env normalizer layering session and request entries over
    /// the kernel's base environment.
    pub fn new(
        kernel: &'a dyn Kernel,
        session_env: Vec<String>,
        env_dump_path: Option<&'a Path>,
    ) -> Self {
        Self {
            kernel,
            session_env,
            env_dump_path,
        }
    }
}

impl Normalizer for EnvNormalizer<'_> {
    fn normalize(
        &self,
        mut cfg: ProgramConfig,
        _cleanups: &mut Vec<CleanupFn>,
    ) -> Result<ProgramConfig, Error> {
        let mut env = self.kernel.base_env();
        env.extend(self.session_env.iter().cloned());
        env.append(&mut cfg.env);
        if let Some(path) = self.env_dump_path {
            env.push(format!("{ENV_DUMP_FILE_VAR}={}", path.display()));
        }

        cfg.env = session::collapse_env(&env);
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct TestKernel {
        programs: HashMap<String, PathBuf>,
    }

    impl TestKernel {
        fn with_programs(names: &[&str]) -> Self {
            Self {
                programs: names
                    .iter()
                    .map(|n| (n.to_string(), PathBuf::from(format!("/usr/bin/{n}"))))
                    .collect(),
            }
        }
    }

    impl Kernel for TestKernel {
        fn look_path(&self, name: &str) -> Result<PathBuf, Error> {
            self.programs
                .get(name)
                .cloned()
                .ok_or_else(|| Error::unresolved_program(name.to_string()))
        }

        fn base_env(&self) -> Vec<String> {
            vec!["BASE=kernel".to_string(), "SHADOWED=base".to_string()]
        }

        fn signal_to_process_group(&self) -> bool {
            false
        }
    }

    fn bash_config() -> ProgramConfig {
        ProgramConfig {
            program_name: "bash".to_string(),
            source: Some(crate::command::config::Source::Commands(vec![
                "echo test".to_string(),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn path_normalizer_resolves_relative_program() {
        let kernel = TestKernel::with_programs(&["bash"]);
        let (cfg, _) =
            normalize_config(bash_config(), &[&PathNormalizer::new(&kernel)]).unwrap();
        assert_eq!(cfg.program_name, "/usr/bin/bash");
    }

    #[test]
    fn path_normalizer_infers_interpreter_from_language() {
        let kernel = TestKernel::with_programs(&["python3"]);
        let cfg = ProgramConfig {
            language_id: "py".to_string(),
            ..Default::default()
        };
        let (cfg, _) = normalize_config(cfg, &[&PathNormalizer::new(&kernel)]).unwrap();
        assert_eq!(cfg.program_name, "/usr/bin/python3");
    }

    #[test]
    fn path_normalizer_falls_back_to_later_candidates() {
        // python3 missing; the table's second candidate resolves.
        let kernel = TestKernel::with_programs(&["python"]);
        let cfg = ProgramConfig {
            language_id: "py".to_string(),
            ..Default::default()
        };
        let (cfg, _) = normalize_config(cfg, &[&PathNormalizer::new(&kernel)]).unwrap();
        assert_eq!(cfg.program_name, "/usr/bin/python");
    }

    #[test]
    fn path_normalizer_fails_for_unknown_language() {
        let kernel = TestKernel::with_programs(&[]);
        let cfg = ProgramConfig {
            language_id: "cobol".to_string(),
            ..Default::default()
        };
        let err = normalize_config(cfg, &[&PathNormalizer::new(&kernel)]);
        assert!(matches!(err, Err(Error::UnresolvedProgram(_))));
    }

    #[test]
    fn mode_normalizer_defaults_to_inline() {
        let (cfg, _) = normalize_config(bash_config(), &[&ModeNormalizer]).unwrap();
        assert_eq!(cfg.mode, CommandMode::Inline);
        assert!(!cfg.interactive);
    }

    #[test]
    fn terminal_mode_forces_interactive() {
        let mut cfg = bash_config();
        cfg.mode = CommandMode::Terminal;
        let (cfg, _) = normalize_config(cfg, &[&ModeNormalizer]).unwrap();
        assert!(cfg.interactive);
    }

    #[test]
    fn args_normalizer_writes_script_file_and_registers_cleanup() {
        let kernel = TestKernel::with_programs(&["bash"]);
        let mut cfg = bash_config();
        cfg.program_name = "/usr/bin/bash".to_string();
        cfg.arguments = vec!["-e".to_string()];

        let (cfg, cleanups) =
            normalize_config(cfg, &[&ArgsNormalizer::new(&kernel, None)]).unwrap();

        assert_eq!(cfg.arguments.len(), 2);
        assert_eq!(cfg.arguments[0], "-e");
        let script_path = PathBuf::from(&cfg.arguments[1]);
        let contents = std::fs::read_to_string(&script_path).unwrap();
        assert_eq!(contents, "echo test\n");
        assert!(cfg.source.is_none());

        for cleanup in cleanups {
            cleanup().unwrap();
        }
        assert!(!script_path.exists());
    }

    #[test]
    fn args_normalizer_prepends_dump_trap_for_shells() {
        let kernel = TestKernel::with_programs(&["bash"]);
        let mut cfg = bash_config();
        cfg.program_name = "/usr/bin/bash".to_string();
        let dump = PathBuf::from("/tmp/runlet-dump");

        let (cfg, cleanups) =
            normalize_config(cfg, &[&ArgsNormalizer::new(&kernel, Some(&dump))]).unwrap();

        let contents = std::fs::read_to_string(&cfg.arguments[0]).unwrap();
        assert!(contents.starts_with("trap 'env -0 > \"/tmp/runlet-dump\"' EXIT\n"));
        assert!(contents.ends_with("echo test\n"));

        for cleanup in cleanups {
            cleanup().unwrap();
        }
    }

    #[test]
    fn args_normalizer_skips_dump_for_non_shells() {
        let kernel = TestKernel::with_programs(&["node"]);
        let cfg = ProgramConfig {
            program_name: "/usr/bin/node".to_string(),
            language_id: "js".to_string(),
            source: Some(crate::command::config::Source::Script(
                "console.log(1)".to_string(),
            )),
            ..Default::default()
        };
        let dump = PathBuf::from("/tmp/runlet-dump");

        let (cfg, cleanups) =
            normalize_config(cfg, &[&ArgsNormalizer::new(&kernel, Some(&dump))]).unwrap();

        let script_path = PathBuf::from(&cfg.arguments[0]);
        assert!(script_path.extension().is_some_and(|e| e == "js"));
        let contents = std::fs::read_to_string(&script_path).unwrap();
        assert_eq!(contents, "console.log(1)\n");

        for cleanup in cleanups {
            cleanup().unwrap();
        }
    }

    #[test]
    fn terminal_mode_leaves_arguments_untouched() {
        let kernel = TestKernel::with_programs(&["bash"]);
        let mut cfg = bash_config();
        cfg.mode = CommandMode::Terminal;
        cfg.arguments = vec!["--norc".to_string()];

        let (cfg, cleanups) =
            normalize_config(cfg, &[&ArgsNormalizer::new(&kernel, None)]).unwrap();

        assert_eq!(cfg.arguments, vec!["--norc"]);
        assert!(cfg.source.is_none());
        assert!(cleanups.is_empty());
    }

    #[test]
    fn env_normalizer_layers_and_collapses() {
        let kernel = TestKernel::with_programs(&[]);
        let mut cfg = bash_config();
        cfg.env = vec!["REQUEST=1".to_string(), "SHADOWED=request".to_string()];
        let session_env = vec!["SESSION=1".to_string(), "SHADOWED=session".to_string()];
        let dump = PathBuf::from("/tmp/dump");

        let (cfg, _) = normalize_config(
            cfg,
            &[&EnvNormalizer::new(&kernel, session_env, Some(&dump))],
        )
        .unwrap();

        assert_eq!(
            cfg.env,
            vec![
                "BASE=kernel",
                "SHADOWED=request",
                "SESSION=1",
                "REQUEST=1",
                "RUNLET_ENV_DUMP_FILE=/tmp/dump",
            ]
        );
    }

    #[test]
    fn shell_detection_uses_the_program_basename() {
        assert!(is_shell_program("/usr/bin/bash"));
        assert!(is_shell_program("sh"));
        assert!(!is_shell_program("/usr/bin/python3"));
        assert!(!is_shell_program(""));
    }
}
