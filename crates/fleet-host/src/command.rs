//! Host command execution with captured output.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crate::error::HostError;
use crate::types::CommandOutput;
use crate::Result;

/// Run `argv` to completion and capture its output.
///
/// The child is killed if the returned future is dropped, so cancelling a
/// run also stops whatever the run was executing. A non-zero exit becomes
/// [`HostError::CommandFailed`] carrying the captured output.
pub async fn run_command(
    argv: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let output = capture(argv, env, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(HostError::CommandFailed {
            command: argv.join(" "),
            output,
        })
    }
}

/// Like [`run_command`] but a non-zero exit is returned as data.
///
/// Used for probes where the exit code is the answer (`systemctl is-active`).
pub async fn capture(
    argv: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let command_line = argv.join(" ");

    let (exe, args) = argv.split_first().ok_or_else(|| HostError::Spawn {
        command: String::new(),
        reason: "empty command".to_string(),
    })?;

    let child = Command::new(exe)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HostError::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| HostError::Timeout {
            command: command_line.clone(),
            timeout_secs: timeout.as_secs(),
        })??;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        command = %command_line,
        exit_code = result.exit_code,
        duration_ms = result.duration_ms,
        "host command finished"
    );
    Ok(result)
}

/// Build an argv from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = run_command(&argv(&["echo", "hello"]), &[], T)
            .await
            .expect("echo");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_command_carries_output() {
        let err = run_command(&argv(&["sh", "-c", "echo oops >&2; exit 3"]), &[], T)
            .await
            .unwrap_err();
        match err {
            HostError::CommandFailed { output, .. } => {
                assert_eq!(output.exit_code, 3);
                assert!(output.stderr.contains("oops"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_capture_returns_nonzero_as_data() {
        let out = capture(&argv(&["false"]), &[], T).await.expect("capture");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let env = vec![("FLEET_TEST_VAR".to_string(), "42".to_string())];
        let out = run_command(&argv(&["sh", "-c", "echo $FLEET_TEST_VAR"]), &env, T)
            .await
            .expect("sh");
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run_command(&argv(&["sleep", "5"]), &[], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_spawn_error() {
        let err = run_command(&[], &[], T).await.unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = run_command(&argv(&["/nonexistent/fleet-binary"]), &[], T)
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Spawn { .. }));
    }
}
