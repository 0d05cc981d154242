//! `nanoagent run`: one message in, one reply out.

use std::sync::Arc;

use na_domain::config::Config;
use na_tools::{ChannelSink, OutboundSink};

use crate::bootstrap;
use crate::runtime::{handle_inbound, InboundMessage, LoopOutcome};

pub async fn run(config: &Config, msg: InboundMessage, json_output: bool) -> anyhow::Result<()> {
    let (sink, mut outbound) = ChannelSink::new(32);
    let sink: Arc<dyn OutboundSink> = Arc::new(sink);
    let ctx = bootstrap::build_engine(config, Some(sink)).await?;

    // Messages the agent sends proactively go to stderr.
    let printer = tokio::spawn(async move {
        while let Some(m) = outbound.recv().await {
            eprintln!("[{} -> {}] {}", m.channel, m.chat_id, m.content);
        }
    });

    let result = handle_inbound(&ctx, msg).await;
    ctx.shutdown().await;
    printer.abort();
    let reply = result?;

    if json_output {
        let json = serde_json::to_string_pretty(&reply)
            .map_err(|e| anyhow::anyhow!("serializing reply: {e}"))?;
        println!("{json}");
    } else {
        println!("{}", reply.text);
    }

    if let LoopOutcome::Failed { error_kind } = reply.outcome {
        anyhow::bail!("agent loop failed: {error_kind}");
    }
    Ok(())
}
