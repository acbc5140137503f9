//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and runs four background tasks around it: a writer
//! draining outbound lines into stdin, a reader framing stdout into JSON-RPC
//! messages, a stderr logger that also watches for readiness keywords, and a
//! supervisor that owns the `Child`, reports its exit, and kills it on request.
//! Everything observed is reported as a [`TransportEvent`] on one channel.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::framing::LineBuffer;
use crate::jsonrpc::JsonRpcMessage;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Substrings in stderr output taken as a sign the server is up.
const READY_KEYWORDS: &[&str] = &["ready", "listening", "started", "running"];

const READ_CHUNK: usize = 8192;

/// How long an exit report waits for stdout to finish draining, so every
/// line the process wrote is delivered before its exit.
const STDOUT_DRAIN: Duration = Duration::from_millis(500);

/// Something the transport observed about its process.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// The first bytes arrived on stdout.
    OutputSeen,
    /// A stderr chunk contained a readiness keyword.
    ReadyKeyword,
    /// A complete, parseable line arrived on stdout.
    Message(JsonRpcMessage),
    /// Stdout reached end of file.
    StdoutClosed,
    /// The process exited with the given code (`None` if killed by a signal).
    Exited(Option<i32>),
    /// A stream or process-handle operation failed.
    Failed(String),
}

/// Async stdio transport for communicating with an MCP server process.
pub(crate) struct StdioTransport {
    write_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    pid: Option<u32>,
}

impl StdioTransport {
    /// Spawn the server process and start the background tasks.
    pub fn spawn(
        name: &str,
        config: &McpServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Protocol("child stderr was not captured".to_string()))?;

        let pid = child.id();
        let shutdown = CancellationToken::new();
        let stdout_done = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(name.to_string(), stdin, write_rx));
        tokio::spawn(read_stdout(
            name.to_string(),
            stdout,
            event_tx.clone(),
            stdout_done.clone(),
        ));
        tokio::spawn(read_stderr(name.to_string(), stderr, event_tx.clone()));
        tokio::spawn(supervise(
            name.to_string(),
            child,
            shutdown.clone(),
            stdout_done,
            event_tx,
        ));

        tracing::debug!("Spawned MCP server '{}' (pid {:?})", name, pid);

        Ok((
            Self {
                write_tx,
                shutdown,
                pid,
            },
            event_rx,
        ))
    }

    /// Queue one serialized message for the child's stdin. Messages are
    /// written in the order they are queued. Returns `false` once the writer
    /// has stopped.
    pub fn send(&self, line: String) -> bool {
        self.write_tx.send(line).is_ok()
    }

    /// Force-kill the process if it is still running.
    pub fn kill(&self) {
        self.shutdown.cancel();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_loop(name: String, mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(msg) = rx.recv().await {
        tracing::debug!("[{}] -> {}", name, msg);
        let written = async {
            stdin.write_all(msg.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            // The process is gone or closed stdin; the supervisor reports the exit.
            tracing::debug!("Write to MCP server '{}' failed: {}", name, e);
            break;
        }
    }
}

async fn read_stdout<R>(
    name: String,
    stdout: R,
    events: mpsc::UnboundedSender<TransportEvent>,
    done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let _done = done.drop_guard();
    frame_stdout(&name, stdout, &events).await;
}

async fn frame_stdout<R>(name: &str, mut stdout: R, events: &mpsc::UnboundedSender<TransportEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut seen_output = false;

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(TransportEvent::Failed(format!("stdout read failed: {e}")));
                return;
            }
        };
        if !seen_output {
            seen_output = true;
            let _ = events.send(TransportEvent::OutputSeen);
        }
        for line in lines.push(&chunk[..n]) {
            dispatch_line(name, &line, events);
        }
    }

    if let Some(rest) = lines.finish() {
        dispatch_line(name, &rest, events);
    }
    let _ = events.send(TransportEvent::StdoutClosed);
}

fn dispatch_line(name: &str, line: &str, events: &mpsc::UnboundedSender<TransportEvent>) {
    tracing::debug!("[{}] <- {}", name, line);
    match JsonRpcMessage::parse(line) {
        Ok(msg) => {
            let _ = events.send(TransportEvent::Message(msg));
        }
        Err(e) => tracing::warn!("Dropping unparseable line from MCP server '{}': {e}: {line}", name),
    }
}

async fn read_stderr<R>(name: String, mut stderr: R, events: mpsc::UnboundedSender<TransportEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut signalled = false;

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if !signalled && contains_ready_keyword(&chunk[..n]) {
            signalled = true;
            let _ = events.send(TransportEvent::ReadyKeyword);
        }
        for line in lines.push(&chunk[..n]) {
            tracing::debug!("[{} stderr] {}", name, line);
        }
    }
    if let Some(rest) = lines.finish() {
        tracing::debug!("[{} stderr] {}", name, rest);
    }
}

fn contains_ready_keyword(chunk: &[u8]) -> bool {
    let text = String::from_utf8_lossy(chunk).to_lowercase();
    READY_KEYWORDS.iter().any(|kw| text.contains(kw))
}

async fn supervise(
    name: String,
    mut child: Child,
    shutdown: CancellationToken,
    stdout_done: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = shutdown.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Kill of MCP server '{}' failed: {}", name, e);
            }
            child.wait().await
        }
    };

    if tokio::time::timeout(STDOUT_DRAIN, stdout_done.cancelled())
        .await
        .is_err()
    {
        tracing::debug!("MCP server '{}' exited with stdout still open", name);
    }

    let event = match status {
        Ok(status) => {
            tracing::debug!("MCP server '{}' exited: {}", name, status);
            TransportEvent::Exited(status.code())
        }
        Err(e) => TransportEvent::Failed(format!("waiting on process failed: {e}")),
    };
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str]) -> McpServerConfig {
        McpServerConfig::new(command, args.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn ready_keywords_are_case_insensitive() {
        assert!(contains_ready_keyword(b"Server Listening on stdio"));
        assert!(contains_ready_keyword(b"MCP server RUNNING"));
        assert!(!contains_ready_keyword(b"loading plugins..."));
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let result = StdioTransport::spawn("bad", &config("this_command_does_not_exist_xyz123", &[]));
        match result {
            Err(McpError::SpawnFailed { name, .. }) => assert_eq!(name, "bad"),
            Err(other) => panic!("Expected SpawnFailed, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[tokio::test]
    async fn echoed_line_is_reported_as_message() {
        // `cat` echoes our request back, which parses as a request from the server.
        let (transport, mut events) = StdioTransport::spawn("cat", &config("cat", &[])).unwrap();
        assert!(transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string()));

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::OutputSeen)
        ));
        match events.recv().await {
            Some(TransportEvent::Message(JsonRpcMessage::Request { method, .. })) => {
                assert_eq!(method, "ping");
            }
            other => panic!("Expected echoed request, got {other:?}"),
        }
        transport.kill();
    }

    #[tokio::test]
    async fn garbage_lines_are_dropped() {
        let (transport, mut events) = StdioTransport::spawn("cat", &config("cat", &[])).unwrap();
        assert!(transport.send("not json at all".to_string()));
        assert!(transport.send(r#"{"jsonrpc":"2.0","id":2,"result":{}}"#.to_string()));

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::OutputSeen)
        ));
        // The garbage line produces no event; the next one is the response.
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Message(JsonRpcMessage::Response(_)))
        ));
        transport.kill();
    }

    #[tokio::test]
    async fn kill_reports_exit() {
        let (transport, mut events) =
            StdioTransport::spawn("sleep", &config("sleep", &["30"])).unwrap();
        assert!(transport.pid().is_some());
        transport.kill();

        loop {
            match events.recv().await {
                Some(TransportEvent::Exited(code)) => {
                    assert_eq!(code, None);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed before exit"),
            }
        }
    }

    #[tokio::test]
    async fn output_is_delivered_before_exit() {
        let (_transport, mut events) = StdioTransport::spawn(
            "quick",
            &config("sh", &["-c", r#"printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'"#]),
        )
        .unwrap();

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let exited = matches!(event, TransportEvent::Exited(_));
            seen.push(match event {
                TransportEvent::OutputSeen => "output",
                TransportEvent::ReadyKeyword => "keyword",
                TransportEvent::Message(_) => "message",
                TransportEvent::StdoutClosed => "closed",
                TransportEvent::Exited(_) => "exited",
                TransportEvent::Failed(_) => "failed",
            });
            if exited {
                break;
            }
        }
        assert_eq!(seen, vec!["output", "message", "closed", "exited"]);
    }

    #[tokio::test]
    async fn stderr_keyword_signals_readiness() {
        let (_transport, mut events) = StdioTransport::spawn(
            "sh",
            &config("sh", &["-c", "echo 'server ready' >&2; sleep 5"]),
        )
        .unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::ReadyKeyword)
        ));
    }

    #[tokio::test]
    async fn env_overlay_and_cwd_are_applied() {
        let script = r#"printf '{"jsonrpc":"2.0","method":"env","params":{"var":"%s","cwd":"%s"}}\n' "$NOTEGRAPH_TEST_VAR" "$(pwd -P)""#;
        let mut cfg = config("sh", &["-c", script]);
        cfg.env = HashMap::from([("NOTEGRAPH_TEST_VAR".to_string(), "42".to_string())]);
        let dir = std::env::temp_dir().canonicalize().unwrap();
        cfg.cwd = Some(dir.clone());
        let (_transport, mut events) = StdioTransport::spawn("env", &cfg).unwrap();

        loop {
            match events.recv().await {
                Some(TransportEvent::Message(JsonRpcMessage::Notification { method, params })) => {
                    assert_eq!(method, "env");
                    let params = params.unwrap();
                    assert_eq!(params["var"], "42");
                    assert_eq!(params["cwd"], dir.display().to_string());
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed before output"),
            }
        }
    }
}
