use std::process::{Output, Stdio};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt as _, process::Command};

use crate::error::InstallError;

/// Runs external block tooling and turns non-zero exits into
/// [`InstallError::ToolFailed`] carrying the tool name and its stderr.
///
/// Nothing is retried at this layer.
#[async_trait]
pub trait CheckToolOutput {
    /// Run to completion and return stdout.
    async fn run_tool(&mut self) -> Result<Vec<u8>>;

    /// Run with `input` piped to stdin and return stdout.
    async fn run_tool_with_input(&mut self, input: &[u8]) -> Result<Vec<u8>>;
}

#[async_trait]
impl CheckToolOutput for Command {
    async fn run_tool(&mut self) -> Result<Vec<u8>> {
        let output = self
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("cannot invoke {}", tool_name(self)))?;
        check_exit(self, output)
    }

    async fn run_tool_with_input(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut child = self
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("cannot invoke {}", tool_name(self)))?;

        let mut stdin = child
            .stdin
            .take()
            .with_context(|| format!("no stdin handle for {}", tool_name(self)))?;
        stdin.write_all(input).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        check_exit(self, output)
    }
}

fn tool_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

fn check_exit(cmd: &Command, output: Output) -> Result<Vec<u8>> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let status = match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_owned(),
    };
    Err(InstallError::ToolFailed {
        tool: tool_name(cmd),
        status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
    .into())
}
