//! Line-delimited JSON bridge for driving the command surface over pipes.
//!
//! Each input line is one [`BridgeRequest`]; each output line is one
//! [`BridgeReply`] echoing the request's `id`. Commands run concurrently, so
//! replies may come back in a different order than the requests.

use crate::commands::McpCommands;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One operation requested by the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HostCommand {
    LoadConfig {
        config: String,
    },
    GetTools,
    CallTool {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    GetStatuses,
    DisconnectAll,
}

/// A command plus an optional correlation id chosen by the host.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeRequest {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub command: HostCommand,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub response: serde_json::Value,
}

impl McpCommands {
    /// Run one host command and serialize its outcome.
    pub async fn execute(&self, command: HostCommand) -> serde_json::Value {
        let value = match command {
            HostCommand::LoadConfig { config } => serde_json::to_value(self.load_config(&config).await),
            HostCommand::GetTools => serde_json::to_value(self.get_tools()),
            HostCommand::CallTool { name, arguments } => {
                let arguments = if arguments.is_null() {
                    serde_json::json!({})
                } else {
                    arguments
                };
                serde_json::to_value(self.call_tool(&name, arguments).await)
            }
            HostCommand::GetStatuses => serde_json::to_value(self.get_statuses()),
            HostCommand::DisconnectAll => serde_json::to_value(self.disconnect_all().await),
        };
        value.unwrap_or_else(|e| failure_value(format!("failed to encode response: {e}")))
    }
}

fn failure_value(error: String) -> serde_json::Value {
    serde_json::json!({ "success": false, "error": error })
}

/// Parse one input line. A line that is not a valid command still yields a
/// reply, carrying the id if one could be recovered.
fn parse_request(line: &str) -> Result<BridgeRequest, BridgeReply> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|e| BridgeReply {
        id: None,
        response: failure_value(format!("invalid command: {e}")),
    })?;
    let id = value.get("id").cloned();
    serde_json::from_value(value).map_err(|e| BridgeReply {
        id,
        response: failure_value(format!("invalid command: {e}")),
    })
}

async fn write_reply<W>(writer: &mut W, reply: &BridgeReply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(reply).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Serve commands from `reader` until EOF, writing replies to `writer`.
/// In-flight commands are allowed to finish before this returns.
pub async fn serve<R, W>(commands: McpCommands, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<BridgeReply>();
    let mut tasks = JoinSet::new();
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_request(&line) {
                    Ok(request) => {
                        let commands = commands.clone();
                        let reply_tx = reply_tx.clone();
                        tasks.spawn(async move {
                            let response = commands.execute(request.command).await;
                            let _ = reply_tx.send(BridgeReply { id: request.id, response });
                        });
                    }
                    Err(reply) => {
                        tracing::warn!("Bridge received an invalid command: {line}");
                        write_reply(&mut writer, &reply).await?;
                    }
                }
            }
            Some(reply) = reply_rx.recv() => write_reply(&mut writer, &reply).await?,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!("Bridge command task failed: {e}");
                }
            }
        }
    }

    drop(reply_tx);
    while let Some(reply) = reply_rx.recv().await {
        write_reply(&mut writer, &reply).await?;
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("Bridge command task failed: {e}");
        }
    }
    Ok(())
}
