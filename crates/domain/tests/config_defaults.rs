use na_domain::config::{Config, McpTransportKind, ProviderKind};

#[test]
fn defaults_are_hardened() {
    let config = Config::default();
    assert!(config.tools.restrict_to_workspace);
    assert!(config.tools.allowed_root.is_none());
    assert_eq!(config.tools.exec.timeout_secs, 60);
    assert_eq!(config.mcp.call_timeout_secs, 30);
    assert!(config.tools.web.timeout_secs < config.tools.exec.timeout_secs);
    assert_eq!(config.sessions.ttl_days, 30);
    assert_eq!(config.mcp.allowed_commands, vec!["npx", "uvx"]);
}

#[test]
fn iteration_cap_default_is_in_range() {
    let config = Config::default();
    assert!((20..=40).contains(&config.agent.max_iterations));
}

#[test]
fn full_config_parses() {
    let toml_str = r#"
[agent]
model = "openai/gpt-4o"
max_iterations = 25

[workspace]
path = "/srv/agent/ws"

[[llm.providers]]
id = "openai"
kind = "openai_compat"
base_url = "https://api.openai.com/v1"
prompt_cache = true
[llm.providers.auth]
env = "OPENAI_API_KEY"

[tools.exec]
timeout_secs = 30
deny_patterns = ["\\bsudo\\b"]

[[mcp.servers]]
name = "files"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

[[mcp.servers]]
name = "remote"
transport = "http"
url = "https://mcp.example.com/mcp"
headers = { Authorization = "Bearer x" }
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.agent.max_iterations, 25);
    assert_eq!(config.llm.providers[0].kind, ProviderKind::OpenaiCompat);
    assert!(config.llm.providers[0].prompt_cache);
    assert_eq!(config.tools.exec.deny_patterns.len(), 1);
    assert_eq!(config.mcp.servers[0].transport, McpTransportKind::Stdio);
    assert_eq!(config.mcp.servers[1].transport, McpTransportKind::Http);
    assert_eq!(
        config.mcp.servers[1].headers.get("Authorization").map(String::as_str),
        Some("Bearer x")
    );
    assert!(config.validate().is_empty());
}

#[test]
fn validate_reports_every_problem() {
    let toml_str = r#"
[agent]
model = "no-namespace"

[[mcp.servers]]
name = "a"
transport = "http"

[[mcp.servers]]
name = "a"
command = "npx"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let problems = config.validate();
    assert_eq!(problems.len(), 3, "{problems:?}");
}
