//! Command driver - delegates to an external `duffle-<name>` plugin
//!
//! Protocol:
//! - `duffle-<name> --handles` prints a comma-separated list of image types and exits 0
//! - `duffle-<name>` receives the operation as JSON on standard input; its exit
//!   status is the result and its combined output is copied to the run output

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{DriverError, Result};
use crate::{Driver, Operation};

/// Driver backed by an executable on PATH
#[derive(Debug, Clone)]
pub struct CommandDriver {
    name: String,
    program: PathBuf,
}

impl CommandDriver {
    /// Locate `duffle-<name>` on PATH
    pub fn find(name: &str) -> Result<Self> {
        let cli_name = Self::cli_name(name);
        let program = which::which(&cli_name).map_err(|_| DriverError::NotFound {
            name: name.to_string(),
        })?;
        Ok(Self::at(name, program))
    }

    /// Use an explicit executable
    pub fn at(name: &str, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
        }
    }

    /// Whether a plugin for `name` is available on PATH
    pub fn exists(name: &str) -> bool {
        which::which(Self::cli_name(name)).is_ok()
    }

    /// Executable name for a driver name
    pub fn cli_name(name: &str) -> String {
        format!("duffle-{}", name.to_lowercase())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Parse the `--handles` reply
fn parse_handles(output: &str) -> Vec<String> {
    output
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[async_trait]
impl Driver for CommandDriver {
    async fn run(&self, op: &Operation) -> Result<()> {
        let payload = serde_json::to_vec(op)?;

        let mut child = Command::new(&self.program)
            .current_dir(std::env::current_dir()?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            // Dropping stdin closes the pipe so the plugin sees EOF
        }

        let output = child.wait_with_output().await?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        op.out.write_bytes(&combined)?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                program: self.program.display().to_string(),
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&combined).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn handles(&self, image_type: &str) -> bool {
        let output = match Command::new(&self.program).arg("--handles").output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                tracing::warn!(program = %self.program.display(), status = %output.status, "--handles failed");
                return false;
            }
            Err(e) => {
                tracing::warn!(program = %self.program.display(), error = %e, "--handles failed");
                return false;
            }
        };
        parse_handles(&String::from_utf8_lossy(&output.stdout))
            .iter()
            .any(|t| t == image_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Output;

    #[test]
    fn test_parse_handles() {
        assert_eq!(parse_handles("docker, oci ,qcow\n"), vec!["docker", "oci", "qcow"]);
        assert!(parse_handles("").is_empty());
    }

    #[test]
    fn test_cli_name() {
        assert_eq!(CommandDriver::cli_name("MyDriver"), "duffle-mydriver");
    }

    #[test]
    fn test_find_missing_plugin() {
        let err = CommandDriver::find("definitely-not-installed-xyz").unwrap_err();
        assert!(matches!(err, DriverError::NotFound { .. }));
        assert!(!CommandDriver::exists("definitely-not-installed-xyz"));
    }

    #[cfg(unix)]
    fn write_plugin(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("duffle-fake");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_protocol() {
        let tmp = tempfile::TempDir::new().unwrap();
        let received = tmp.path().join("op.json");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--handles\" ]; then echo 'docker, oci'; exit 0; fi\ncat > {}\necho ran\n",
            received.display()
        );
        let driver = CommandDriver::at("fake", write_plugin(tmp.path(), &script));

        assert!(driver.handles("oci").await);
        assert!(!driver.handles("qcow").await);

        let (out, capture) = Output::capture();
        let op = Operation {
            installation: "myrelease".to_string(),
            action: "install".to_string(),
            image_type: "oci".to_string(),
            out,
            ..Default::default()
        };
        driver.run(&op).await.unwrap();

        let sent: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&received).unwrap()).unwrap();
        assert_eq!(sent["installation_name"], "myrelease");
        assert_eq!(capture.contents(), "ran\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let script = "#!/bin/sh\ncat > /dev/null\necho 'no cluster' >&2\nexit 3\n";
        let driver = CommandDriver::at("fake", write_plugin(tmp.path(), script));

        let (out, capture) = Output::capture();
        let op = Operation {
            out,
            ..Default::default()
        };
        let err = driver.run(&op).await.unwrap_err();
        match err {
            DriverError::CommandFailed { output, .. } => assert_eq!(output, "no cluster"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(capture.contents().contains("no cluster"));
    }
}
