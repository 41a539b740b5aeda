//! Post-install commands, run after a certificate set has been written.

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::info;

/// Run each command through `sh -c`, in order. Output is logged line by line.
/// The first failing command stops the sequence; earlier commands are not
/// undone.
pub async fn run_commands<S: AsRef<str>>(commands: &[S]) -> Result<()> {
    for command in commands {
        let command = command.as_ref();
        info!(command, "Executing renew command");
        run_command(command).await?;
        info!(command, "Successfully executed renew command");
    }
    Ok(())
}

/// Run one command with stderr folded into stdout, so the logged lines keep
/// the order the command wrote them in. Returns the non-empty output lines.
async fn run_command(command: &str) -> Result<Vec<String>> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(format!("exec 2>&1\n{}", command))
        .output()
        .await
        .with_context(|| format!("Failed to start command '{}'", command))?;

    let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();
    for line in &lines {
        info!(command, line = %line, "Command output");
    }

    if !output.status.success() {
        bail!("Failed to execute command '{}': {}", command, output.status);
    }
    Ok(lines)
}
