//! Stdio transport: JSON-RPC over a child process's stdin/stdout.
//!
//! One request/response cycle holds the I/O lock for its whole duration
//! so concurrent callers cannot read each other's responses. Servers may
//! interleave notifications; anything without our request id is skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::config::McpServerConfig;
use crate::protocol::{RpcMessage, RpcResponse};

/// How long to wait for a response before declaring the server stuck.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Non-JSON stdout lines tolerated before declaring the server broken
/// (some servers leak logging onto stdout).
const MAX_SKIP_LINES: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for MCP response")]
    Timeout,
}

/// The pipes to one child process, guarded as a unit.
struct Io {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct StdioTransport {
    io: Mutex<Io>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioTransport {
    /// Spawn the server process described by `config`.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            io: Mutex::new(Io {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<RpcResponse, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = RpcMessage::request(id, method, params);
        let json = serde_json::to_string(&msg)?;

        let mut io = self.io.lock().await;

        tracing::debug!(id, method, "sending MCP request");
        io.stdin.write_all(json.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;

        let deadline = tokio::time::Duration::from_secs(REQUEST_TIMEOUT_SECS);
        let result = tokio::time::timeout(deadline, async {
            let mut skipped = 0usize;
            loop {
                let mut line = String::new();
                let n = io.stdout.read_line(&mut line).await?;
                if n == 0 {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(TransportError::ProcessExited);
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed.starts_with('{') {
                    if let Ok(resp) = serde_json::from_str::<RpcResponse>(trimmed) {
                        if resp.id == Some(id) {
                            return Ok(resp);
                        }
                    }
                    // A notification or a stale response; keep reading.
                    continue;
                }
                skipped += 1;
                if skipped >= MAX_SKIP_LINES {
                    self.alive.store(false, Ordering::SeqCst);
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "MCP server produced too many non-JSON lines on stdout",
                    )));
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let json = serde_json::to_string(&RpcMessage::notification(method))?;
        let mut io = self.io.lock().await;
        io.stdin.write_all(json.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        Ok(())
    }

    /// Close stdin and give the process a moment to exit; kill if it won't.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut io = self.io.lock().await;
            if let Err(e) = io.stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(tokio::time::Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "MCP server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}
