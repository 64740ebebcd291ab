//! Bounded subprocess execution for external probe binaries.
//!
//! Tools either run directly on the host or inside a tools container
//! (`docker exec <container> ...`) when `DSC_TOOLS_CONTAINER` is configured,
//! the same layout the deployment images use. Stdout is captured line by
//! line so an optional observer can stream it; stderr is captured for
//! failure reporting. A probe that outlives its timeout is killed.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::LineSink;

/// Captured output of one tool invocation.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// How probe binaries are invoked.
#[derive(Debug, Clone, Default)]
pub struct ToolExec {
    /// When set, wrap every invocation in `docker exec <container>`.
    pub container: Option<String>,
}

impl ToolExec {
    pub fn direct() -> Self {
        Self { container: None }
    }

    pub fn in_container(container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
        }
    }

    /// Run `argv` with a hard timeout, streaming stdout lines to `stream`.
    ///
    /// Returns `Err` only for spawn failures and timeouts; a non-zero exit is
    /// reported through `ExecOutput::exit_code` so adapters can decide what a
    /// partial result means.
    pub async fn run(
        &self,
        argv: &[&str],
        timeout: Duration,
        stream: Option<LineSink>,
    ) -> Result<ExecOutput> {
        let (program, rest) = self.wrap(argv)?;

        let mut child = Command::new(&program)
            .args(&rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {program}"))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout not captured"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("child stderr not captured"))?;

        let collect = async {
            // Drain both pipes concurrently; a tool that floods stderr must
            // not stall the stdout reader (or vice versa).
            let stdout_task = async {
                let mut lines = BufReader::new(stdout_pipe).lines();
                let mut stdout = String::new();
                while let Some(line) = lines.next_line().await? {
                    if let Some(sink) = stream.as_ref() {
                        sink(&line);
                    }
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                Ok::<String, anyhow::Error>(stdout)
            };
            let stderr_task = async {
                let mut stderr = String::new();
                stderr_pipe.read_to_string(&mut stderr).await?;
                Ok::<String, anyhow::Error>(stderr)
            };

            let (stdout, stderr) = tokio::try_join!(stdout_task, stderr_task)?;
            let status = child.wait().await?;
            Ok::<ExecOutput, anyhow::Error>(ExecOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
            })
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(out) => out,
            Err(_) => Err(anyhow!(
                "{} timed out after {}s",
                argv.first().copied().unwrap_or("tool"),
                timeout.as_secs()
            )),
        }
    }

    fn wrap(&self, argv: &[&str]) -> Result<(String, Vec<String>)> {
        let mut full: Vec<String> = Vec::with_capacity(argv.len() + 3);
        if let Some(container) = &self.container {
            full.push("docker".to_string());
            full.push("exec".to_string());
            full.push(container.clone());
        }
        full.extend(argv.iter().map(|s| s.to_string()));

        let program = full
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("empty command"))?;
        Ok((program, full[1..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_wrapping() {
        let direct = ToolExec::direct();
        let (prog, rest) = direct.wrap(&["subfinder", "-d", "acme.test"]).unwrap();
        assert_eq!(prog, "subfinder");
        assert_eq!(rest, vec!["-d", "acme.test"]);

        let wrapped = ToolExec::in_container("recon-tools");
        let (prog, rest) = wrapped.wrap(&["subfinder", "-d", "acme.test"]).unwrap();
        assert_eq!(prog, "docker");
        assert_eq!(rest, vec!["exec", "recon-tools", "subfinder", "-d", "acme.test"]);
    }
}
