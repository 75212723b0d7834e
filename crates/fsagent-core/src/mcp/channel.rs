//! Owns the tool-server subprocess and its stdio channel.
//!
//! The channel enforces a one-at-a-time request discipline: correlation
//! ids are sequential and at most one invocation is in flight, so a reply
//! with an id below the awaited one can only be the late answer to a
//! timed-out call and is skipped.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

use crate::core::events::ContentBlock;
use crate::mcp::catalog::{ToolCatalog, ToolDescriptor};
use crate::mcp::protocol::{
    self, Incoming, Notification, Request, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS,
};

/// Error categories for channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// The subprocess could not be spawned.
    Launch,
    /// The capability handshake did not complete within the bound.
    HandshakeTimeout,
    /// The subprocess exited or closed its stdout.
    SubprocessExited,
    /// Malformed or out-of-order traffic on the channel.
    Protocol,
    /// A request did not complete within the bound.
    Timeout,
}

impl fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelErrorKind::Launch => write!(f, "launch"),
            ChannelErrorKind::HandshakeTimeout => write!(f, "handshake_timeout"),
            ChannelErrorKind::SubprocessExited => write!(f, "subprocess_exited"),
            ChannelErrorKind::Protocol => write!(f, "protocol"),
            ChannelErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured error from the channel with kind and details.
#[derive(Debug, Clone)]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Optional additional details (e.g. the offending line).
    pub details: Option<String>,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// True when the subprocess is gone and the channel cannot recover.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ChannelErrorKind::SubprocessExited)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ChannelError {}

/// Fully built launch command for the tool server.
///
/// The program and arguments are opaque strings passed through unchanged;
/// the configuration layer appends the single root restriction argument.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Timeout bounds for channel operations.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub handshake_timeout: Duration,
    pub invoke_timeout: Duration,
    pub close_grace: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(20),
            invoke_timeout: Duration::from_secs(60),
            close_grace: Duration::from_secs(3),
        }
    }
}

/// Outcome of one `tools/call` round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPayload {
    /// Content blocks from the server; `None` when the reply carried no
    /// content at all.
    pub content: Option<Vec<ContentBlock>>,
    pub is_error: bool,
}

/// Stdio channel to a running tool-server subprocess.
#[derive(Debug)]
pub struct ToolChannel {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    next_id: u64,
    options: ChannelOptions,
}

impl ToolChannel {
    /// Spawns the subprocess and performs the capability handshake.
    ///
    /// # Errors
    /// `Launch` when the spawn fails, `HandshakeTimeout` when the server
    /// does not answer `initialize` within the bound, `SubprocessExited`
    /// when it dies during the handshake.
    pub async fn launch(
        command: &ServerCommand,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        tracing::info!(program = %command.program, "launching tool server");

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ChannelError::new(
                    ChannelErrorKind::Launch,
                    format!("failed to spawn '{}'", command.program),
                )
                .with_details(format!("OS error: {e}"))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ChannelError::new(ChannelErrorKind::Launch, "subprocess stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ChannelError::new(ChannelErrorKind::Launch, "subprocess stdout not captured")
        })?;

        let mut channel = Self {
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            next_id: 1,
            options,
        };

        let params = protocol::initialize_params("fsagent", env!("CARGO_PKG_VERSION"));
        let handshake_timeout = channel.options.handshake_timeout;
        channel
            .request(METHOD_INITIALIZE, Some(params), handshake_timeout)
            .await
            .map_err(|e| match e.kind {
                ChannelErrorKind::Timeout => ChannelError {
                    kind: ChannelErrorKind::HandshakeTimeout,
                    message: format!(
                        "handshake timed out after {} seconds",
                        handshake_timeout.as_secs()
                    ),
                    details: e.details,
                },
                _ => e,
            })?;
        channel.notify(Notification::initialized()).await?;

        tracing::info!("tool server handshake complete");
        Ok(channel)
    }

    /// Issues the single `tools/list` discovery request.
    ///
    /// # Errors
    /// `Protocol` when the declared list does not parse.
    pub async fn list_tools(&mut self) -> Result<ToolCatalog, ChannelError> {
        let result = self
            .request(METHOD_LIST_TOOLS, None, self.options.invoke_timeout)
            .await?;

        let tools = result.get("tools").cloned().ok_or_else(|| {
            ChannelError::new(ChannelErrorKind::Protocol, "tools/list reply has no tool list")
                .with_details(result.to_string())
        })?;
        let descriptors: Vec<ToolDescriptor> = serde_json::from_value(tools).map_err(|e| {
            ChannelError::new(ChannelErrorKind::Protocol, "malformed tool descriptor")
                .with_details(e.to_string())
        })?;

        tracing::info!(count = descriptors.len(), "discovered tools");
        Ok(ToolCatalog::from_descriptors(descriptors))
    }

    /// Invokes one tool and waits for its correlated result.
    ///
    /// # Errors
    /// `Timeout` when the bound elapses, `SubprocessExited` when the
    /// server dies mid-call, `Protocol` for malformed traffic.
    pub async fn invoke(
        &mut self,
        name: &str,
        arguments: &Value,
    ) -> Result<ToolPayload, ChannelError> {
        let params = protocol::call_tool_params(name, arguments);
        let result = self
            .request(METHOD_CALL_TOOL, Some(params), self.options.invoke_timeout)
            .await?;

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = match result.get("content") {
            None => None,
            Some(blocks) => Some(serde_json::from_value(blocks.clone()).map_err(|e| {
                ChannelError::new(ChannelErrorKind::Protocol, "malformed tool result content")
                    .with_details(e.to_string())
            })?),
        };

        Ok(ToolPayload { content, is_error })
    }

    /// Tears the subprocess down. Idempotent; never fails the caller.
    ///
    /// Closing stdin is the graceful termination signal for a stdio
    /// server; after the grace period the child is killed.
    pub async fn close(&mut self) {
        // Dropping stdin signals EOF to the server.
        self.stdin.take();
        self.stdout.take();

        let Some(mut child) = self.child.take() else {
            return;
        };

        match timeout(self.options.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "tool server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to reap tool server");
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = self.options.close_grace.as_secs(),
                    "tool server did not exit in time, killing"
                );
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill tool server");
                }
                if let Err(e) = child.wait().await {
                    tracing::warn!(error = %e, "failed to reap killed tool server");
                }
            }
        }
    }

    /// True while the subprocess handle is held.
    pub fn is_open(&self) -> bool {
        self.child.is_some()
    }

    async fn notify(&mut self, notification: Notification) -> Result<(), ChannelError> {
        let line = serde_json::to_string(&notification).map_err(|e| {
            ChannelError::new(ChannelErrorKind::Protocol, "failed to encode notification")
                .with_details(e.to_string())
        })?;
        self.write_line(&line).await
    }

    /// One correlated round-trip under a single overall timeout.
    async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        bound: Duration,
    ) -> Result<Value, ChannelError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, params);
        let line = serde_json::to_string(&request).map_err(|e| {
            ChannelError::new(ChannelErrorKind::Protocol, "failed to encode request")
                .with_details(e.to_string())
        })?;

        tracing::debug!(id, method, "-> {line}");
        // The write stays outside the timed region: cancelling a partial
        // write would leave a broken frame on the pipe.
        self.write_line(&line).await?;
        match timeout(bound, self.await_reply(id)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::new(
                ChannelErrorKind::Timeout,
                format!("no reply to {method} within {} seconds", bound.as_secs()),
            )),
        }
    }

    async fn await_reply(&mut self, id: u64) -> Result<Value, ChannelError> {
        loop {
            let reply = self.read_line().await?;
            let incoming = match Incoming::parse(&reply) {
                Ok(incoming) => incoming,
                Err(e) => {
                    return Err(ChannelError::new(
                        ChannelErrorKind::Protocol,
                        "unparseable line from tool server",
                    )
                    .with_details(format!("{e}: {reply}")));
                }
            };

            if incoming.is_notification() {
                tracing::debug!(method = ?incoming.method, "<- notification (skipped)");
                continue;
            }
            match incoming.id {
                Some(reply_id) if reply_id == id => {
                    if let Some(error) = incoming.error {
                        return Err(ChannelError::new(
                            ChannelErrorKind::Protocol,
                            format!("server error {}: {}", error.code, error.message),
                        ));
                    }
                    return incoming.result.ok_or_else(|| {
                        ChannelError::new(
                            ChannelErrorKind::Protocol,
                            "reply carried neither result nor error",
                        )
                        .with_details(reply)
                    });
                }
                Some(reply_id) if reply_id < id => {
                    // Late answer to a call that already timed out.
                    tracing::debug!(reply_id, awaiting = id, "<- stale reply (skipped)");
                }
                _ => {
                    return Err(ChannelError::new(
                        ChannelErrorKind::Protocol,
                        "reply for an id that was never issued",
                    )
                    .with_details(reply));
                }
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            ChannelError::new(ChannelErrorKind::SubprocessExited, "channel is closed")
        })?;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|e| {
            ChannelError::new(ChannelErrorKind::SubprocessExited, "tool server stdin closed")
                .with_details(format!("OS error: {e}"))
        })
    }

    async fn read_line(&mut self) -> Result<String, ChannelError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| {
            ChannelError::new(ChannelErrorKind::SubprocessExited, "channel is closed")
        })?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = stdout.read_line(&mut line).await.map_err(|e| {
                ChannelError::new(ChannelErrorKind::SubprocessExited, "tool server stdout closed")
                    .with_details(format!("OS error: {e}"))
            })?;
            if n == 0 {
                return Err(ChannelError::new(
                    ChannelErrorKind::SubprocessExited,
                    "tool server closed its stdout",
                ));
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }
}
