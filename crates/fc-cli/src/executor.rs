use std::process::Output;

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("binary not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Runs an external framework CLI (`labgrid-client`, `lava-tool`, ...) as a
/// subprocess and captures its output. Stateless beyond the binary path, so
/// it is cheaply `Clone` and safe to share across plugin tasks.
///
/// Generalizes the single-purpose tmux executor this crate started life
/// as: plugins shell out to whatever command-line tool fronts their
/// framework, then parse the captured stdout themselves (see
/// [`Self::run_yaml`] for the common case of a command that emits YAML).
#[derive(Debug, Clone)]
pub struct CliExecutor {
    bin: String,
}

impl CliExecutor {
    /// Create an executor for `bin`, resolved against `$PATH`.
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Run the command and return stdout as a `String`.
    ///
    /// Returns [`CliError::CommandFailed`] on non-zero exit,
    /// [`CliError::NotFound`] if the binary can't be resolved.
    pub async fn run(&self, args: &[&str]) -> Result<String, CliError> {
        let output = self.run_raw(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CliError::CommandFailed(format!(
                "{} {}: exit {}: {}",
                self.bin,
                args.join(" "),
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                stderr.trim(),
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run the command and return the raw `Output` without checking exit
    /// status — for callers that need to distinguish exit codes themselves
    /// (e.g. a "device busy" convention encoded as a specific code).
    pub async fn run_unchecked(&self, args: &[&str]) -> Result<Output, CliError> {
        self.run_raw(args).await
    }

    /// Run the command and parse its stdout as YAML. Most framework CLIs
    /// in this domain (`labgrid-client --format yaml ...`) emit YAML for
    /// machine consumption; this is the common path plugins use.
    pub async fn run_yaml<T: serde::de::DeserializeOwned>(
        &self,
        args: &[&str],
    ) -> Result<T, CliError> {
        let stdout = self.run(args).await?;
        serde_yaml::from_str(&stdout).map_err(|source| CliError::Parse {
            what: format!("{} {}", self.bin, args.join(" ")),
            source,
        })
    }

    async fn run_raw(&self, args: &[&str]) -> Result<Output, CliError> {
        Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CliError::NotFound(self.bin.clone())
                } else {
                    CliError::Io(e)
                }
            })
    }
}
