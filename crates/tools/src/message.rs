//! `message` tool: push a message to a channel outside the current reply.

use std::sync::Arc;

use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::tool::{parse_args, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput};

/// A message for a channel adapter to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// Where outbound messages go. Channel adapters own the other end.
#[async_trait::async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> na_domain::Result<()>;
}

/// [`OutboundSink`] backed by a bounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl OutboundSink for ChannelSink {
    async fn send(&self, message: OutboundMessage) -> na_domain::Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| na_domain::Error::Other("outbound channel closed".into()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MessageRequest {
    content: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
}

pub struct MessageTool {
    sink: Arc<dyn OutboundSink>,
}

impl MessageTool {
    pub fn new(sink: Arc<dyn OutboundSink>) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for MessageTool {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: MessageRequest = parse_args(args)?;
        let channel = req
            .channel
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ctx.channel.clone());
        let chat_id = req
            .chat_id
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ctx.sender_id.clone());
        if channel.is_empty() || chat_id.is_empty() {
            return Err(ToolError::validation("No target channel/chat specified"));
        }

        self.sink
            .send(OutboundMessage {
                channel: channel.clone(),
                chat_id: chat_id.clone(),
                content: req.content,
            })
            .await
            .map_err(|e| ToolError::execution(format!("Error sending message: {e}")))?;

        Ok(ToolOutput::text(format!("Message sent to {channel}:{chat_id}"))
            .with_artifact("message_sent", json!({ "channel": channel, "chat_id": chat_id })))
    }
}

impl BuiltinTool for MessageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "message".into(),
            description: "Send a message to the user. Defaults to the current conversation.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": { "type": "string", "description": "The message content to send" },
                    "channel": { "type": "string", "description": "Optional target channel" },
                    "chat_id": { "type": "string", "description": "Optional target chat/user id" }
                },
                "required": ["content"]
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_the_inbound_conversation() {
        let (sink, mut rx) = ChannelSink::new(4);
        let tool = MessageTool::new(Arc::new(sink));
        let ctx = ToolContext {
            channel: "telegram".into(),
            sender_id: "42".into(),
            ..ToolContext::default()
        };

        let out = tool.invoke(&ctx, json!({"content": "ping"})).await.unwrap();
        assert_eq!(out.payload, json!("Message sent to telegram:42"));
        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundMessage {
                channel: "telegram".into(),
                chat_id: "42".into(),
                content: "ping".into(),
            }
        );
    }

    #[tokio::test]
    async fn closed_sink_is_an_execution_error() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        let tool = MessageTool::new(Arc::new(sink));
        let ctx = ToolContext {
            channel: "cli".into(),
            sender_id: "me".into(),
            ..ToolContext::default()
        };
        let err = tool.invoke(&ctx, json!({"content": "x"})).await.unwrap_err();
        assert_eq!(err.kind, na_domain::ErrorKind::ToolExecution);
    }
}
