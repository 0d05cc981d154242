use na_domain::config::Config;

use crate::bootstrap;

/// Print the tool registry after connecting every configured server.
pub async fn list(config: &Config, json_output: bool) -> anyhow::Result<()> {
    let ctx = bootstrap::build_engine(config, None).await?;
    let descriptors = ctx.tools.descriptors();
    ctx.shutdown().await;

    if json_output {
        let json = serde_json::to_string_pretty(&descriptors)
            .map_err(|e| anyhow::anyhow!("serializing tools: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    for d in &descriptors {
        let summary = d.definition.description.lines().next().unwrap_or_default();
        println!("{:<32} {:<16} {}", d.name(), d.origin.to_string(), summary);
    }
    Ok(())
}
