//! Shell and code execution inside a request workspace.
//!
//! Foreground only: run the command, wait up to the timeout, return the
//! combined output. Output is truncated head+tail so a runaway command
//! cannot blow up the conversation.

use std::path::Path;
use std::process::Stdio;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Outcome of one command or code execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Truncate command output, keeping the head and tail.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }
    let half = max_chars / 2;
    let head_end = floor_char_boundary(output, half);
    let tail_start = ceil_char_boundary(output, output.len() - half);
    format!(
        "{}\n\n[... output truncated ({} chars total) ...]\n\n{}",
        &output[..head_end],
        output.len(),
        &output[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Run a shell command in `workdir` with a hard timeout.
pub async fn run_command(
    command: &str,
    workdir: &Path,
    timeout_sec: u64,
    max_output_chars: usize,
) -> ExecOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    run_child(cmd, timeout_sec, max_output_chars, None).await
}

/// Run Python code: the code is piped to `python3` on stdin with the
/// workspace as the working directory, so relative output paths land in
/// the workspace and get picked up by the file scanner.
pub async fn run_python(
    code: &str,
    workdir: &Path,
    timeout_sec: u64,
    max_output_chars: usize,
) -> ExecOutcome {
    let mut cmd = Command::new("python3");
    cmd.arg("-")
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    run_child(cmd, timeout_sec, max_output_chars, Some(code.to_string())).await
}

async fn run_child(
    mut cmd: Command,
    timeout_sec: u64,
    max_output_chars: usize,
    stdin_data: Option<String>,
) -> ExecOutcome {
    // A timed-out child must not outlive the dropped wait future.
    cmd.kill_on_drop(true);
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ExecOutcome {
                success: false,
                output: format!("failed to spawn: {e}"),
                exit_code: None,
            };
        }
    };

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                tracing::warn!(error = %e, "failed to write code to child stdin");
            }
            drop(stdin);
        }
    }

    let deadline = std::time::Duration::from_secs(timeout_sec);
    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(out)) => {
            let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            ExecOutcome {
                success: out.status.success(),
                output: truncate_output(&combined, max_output_chars),
                exit_code: out.status.code(),
            }
        }
        Ok(Err(e)) => ExecOutcome {
            success: false,
            output: format!("process error: {e}"),
            exit_code: None,
        },
        Err(_) => ExecOutcome {
            success: false,
            output: format!("command timed out after {timeout_sec}s"),
            exit_code: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_captures_stdout_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_command("echo hello", tmp.path(), 10, 20_000).await;
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_command("ls /definitely/not/here", tmp.path(), 10, 20_000).await;
        assert!(!out.success);
        assert_ne!(out.exit_code, Some(0));
        assert!(!out.output.is_empty());
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_command("sleep 30", tmp.path(), 1, 20_000).await;
        assert!(!out.success);
        assert!(out.output.contains("timed out"));
    }

    #[tokio::test]
    async fn command_runs_in_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = run_command("echo data > out.txt && cat out.txt", tmp.path(), 10, 20_000).await;
        assert!(out.success);
        assert!(tmp.path().join("out.txt").exists());
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let long: String = "x".repeat(50_000);
        let truncated = truncate_output(&long, 1_000);
        assert!(truncated.len() < 2_000);
        assert!(truncated.contains("output truncated"));
    }

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("fine", 100), "fine");
    }
}
