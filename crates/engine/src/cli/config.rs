use std::path::Path;

use na_domain::config::Config;

/// Validate the config, printing any problems. Returns `true` when valid.
pub fn validate(config: &Config, config_path: &Path) -> bool {
    let problems = config.validate();

    if problems.is_empty() {
        println!("Config OK ({})", config_path.display());
        return true;
    }

    for p in &problems {
        println!("error: {p}");
    }
    println!("\n{} error(s) in {}", problems.len(), config_path.display());
    false
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("serializing config: {e}"))?;
    print!("{output}");
    Ok(())
}
