//! Built-in callables.
//!
//! - `shell`: run `command` through `sh -c`; output is
//!   `{stdout, stderr, exit_code}`. A non-zero exit fails the call unless
//!   `check: false` is passed.
//! - `echo`: return its argument unchanged.

use crate::registry::{action_fn, CallArgs, ComponentRegistry, RegistryError};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::process::Stdio;

/// Register `shell` and `echo` as callables.
pub fn register_builtins(registry: &mut ComponentRegistry) -> Result<(), RegistryError> {
    registry.register_callable("shell", action_fn(shell))?;
    registry.register_callable("echo", action_fn(echo))?;
    Ok(())
}

async fn shell(args: CallArgs) -> Result<Value> {
    let command = match args.kwarg("command").or_else(|| args.args.first()) {
        Some(Value::String(command)) => command.clone(),
        Some(other) => bail!("shell: 'command' must be a string, got {other}"),
        None => bail!("shell: missing 'command'"),
    };
    let check = args.kwarg("check").and_then(Value::as_bool).unwrap_or(true);

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = args.kwarg("cwd").and_then(Value::as_str) {
        cmd.current_dir(cwd);
    }

    tracing::debug!(%command, "running shell command");
    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to spawn shell for '{command}'"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let exit_code = output.status.code();

    if check && !output.status.success() {
        bail!(
            "command '{}' exited with status {}: {}",
            command,
            output.status,
            stderr.trim()
        );
    }

    Ok(json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": exit_code,
    }))
}

async fn echo(args: CallArgs) -> Result<Value> {
    let value = match (args.args.len(), args.kwarg("message")) {
        (0, Some(message)) => message.clone(),
        (0, None) => Value::Object(args.kwargs),
        (1, _) => args.args.into_iter().next().unwrap_or_default(),
        _ => Value::Array(args.args),
    };
    tracing::info!(%value, "echo");
    Ok(value)
}
