use std::{ffi::OsStr, process::Stdio};

use anyhow::{Context, Result, bail};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

fn describe(program: &OsStr) -> String {
    program.to_string_lossy().to_string()
}

/// Runs a host tool to completion and returns its stdout. A non-zero exit becomes an error
/// carrying the tool's stderr.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null());
    debug!("exec {:?}", command.as_std());

    let output = command
        .output()
        .await
        .with_context(|| format!("failed to execute {}", describe(program)))?;

    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            describe(program),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Same as [`run`], feeding `input` to the tool's stdin.
pub async fn run_with_stdin<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    input: &[u8],
) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to execute {}", describe(program)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "{} failed ({}): {}",
            describe(program),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
