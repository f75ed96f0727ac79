//! Running external programs and handing them JSON parameter files.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// `run(command, args) -> output`
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> AppResult<ProcessOutput>;
}

/// Spawns real processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &Path, args: &[String]) -> AppResult<ProcessOutput> {
        debug!(program = %program.display(), ?args, "Running command");

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Resolve `command` against the `PATH` environment variable.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    find_in_dirs(command, std::env::split_paths(&path_var), |p| p.is_file())
}

fn find_in_dirs<I, F>(command: &str, dirs: I, exists: F) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
    F: Fn(&Path) -> bool,
{
    let names: Vec<String> = if cfg!(windows) {
        vec![format!("{command}.exe"), format!("{command}.cmd")]
    } else {
        vec![command.to_string()]
    };

    dirs.into_iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|path| exists(path))
}

/// JSON written to a temporary file that is removed when this value drops,
/// whichever way the surrounding call exits.
#[derive(Debug)]
pub struct JsonParamFile {
    file: NamedTempFile,
}

impl JsonParamFile {
    pub fn write<T: Serialize>(value: &T) -> AppResult<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("fedlink-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut file, value)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// `@<path>`, the Azure CLI convention for "read this argument from a file".
    pub fn cli_argument(&self) -> String {
        format!("@{}", self.path().display())
    }
}

/// Map a failed process to an error, spotting authorization failures.
pub fn check_output(program: &str, args: &[String], output: ProcessOutput) -> AppResult<ProcessOutput> {
    if output.success() {
        return Ok(output);
    }

    let stderr = output.stderr.trim().to_string();
    let denied = ["Forbidden", "Authorization_RequestDenied", "AuthorizationFailed", "Insufficient privileges"];
    if denied.iter().any(|marker| stderr.contains(marker)) {
        return Err(AppError::InsufficientPermissions(stderr));
    }

    Err(AppError::Cli {
        command: format!("{} {}", program, args.join(" ")),
        code: output.exit_code,
        stderr,
    })
}
