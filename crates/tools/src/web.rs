//! `web_fetch` and `web_search` tools.

use std::sync::Arc;
use std::time::Duration;

use na_domain::config::WebConfig;
use na_domain::error::ToolError;
use na_domain::tool::ToolDefinition;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::sandbox::web::USER_AGENT;
use crate::sandbox::{strip_userinfo, WebPolicy};
use crate::tool::{parse_args, BuiltinTool, InvokeResult, ToolContext, ToolInvoker, ToolOutput};

const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";
const MIN_MAX_CHARS: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// web_fetch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ExtractMode {
    #[default]
    Markdown,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    url: String,
    #[serde(default)]
    extract_mode: ExtractMode,
    #[serde(default)]
    max_chars: Option<usize>,
}

pub struct WebFetchTool {
    policy: Arc<WebPolicy>,
    max_chars: usize,
}

impl WebFetchTool {
    pub fn new(policy: Arc<WebPolicy>, max_chars: usize) -> Self {
        Self { policy, max_chars }
    }
}

#[async_trait::async_trait]
impl ToolInvoker for WebFetchTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: FetchRequest = parse_args(args)?;
        let max_chars = req.max_chars.unwrap_or(self.max_chars).max(MIN_MAX_CHARS);

        let page = self
            .policy
            .fetch(&req.url, "text/html,application/xhtml+xml,application/json,text/plain,*/*;q=0.8")
            .await?;

        let body = String::from_utf8_lossy(&page.body);
        let ct = page.content_type.to_ascii_lowercase();
        let (text, extractor) = if ct.contains("application/json") || ct.contains("+json") {
            let pretty = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok())
                .unwrap_or_else(|| body.to_string());
            (pretty, "json")
        } else if ct.contains("text/html") || looks_like_html(&body) {
            (html_to_readable(&body, req.extract_mode), "html")
        } else {
            (body.to_string(), "raw")
        };

        let total = text.chars().count();
        let truncated = page.truncated || total > max_chars;
        let text: String = if total > max_chars {
            text.chars().take(max_chars).collect()
        } else {
            text
        };

        Ok(ToolOutput::json(json!({
            "url": strip_userinfo(&req.url),
            "finalUrl": strip_userinfo(page.final_url.as_str()),
            "status": page.status,
            "extractor": extractor,
            "truncated": truncated,
            "length": text.chars().count(),
            "text": text,
        })))
    }
}

impl BuiltinTool for WebFetchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_fetch".into(),
            description: "Fetch a URL and extract its readable content (HTML to markdown or text).".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "http or https URL" },
                    "extractMode": { "type": "string", "enum": ["markdown", "text"], "default": "markdown" },
                    "maxChars": { "type": "integer", "minimum": MIN_MAX_CHARS }
                },
                "required": ["url"]
            }),
        }
    }

    fn timeout(&self) -> Duration {
        // One client timeout per hop is enforced inside; this bounds the chain.
        self.policy.timeout() + Duration::from_secs(10)
    }
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

// ── HTML extraction ─────────────────────────────────────────────────

/// Extract readable content from HTML. Script and style bodies are
/// dropped. In markdown mode headings, list items and links keep their
/// structure. The document title, if any, leads the output.
fn html_to_readable(html: &str, mode: ExtractMode) -> String {
    let markdown = mode == ExtractMode::Markdown;
    let mut out = String::new();
    let mut title = String::new();
    let mut in_tag = false;
    let mut skip_depth: Option<&'static str> = None;
    let mut in_title = false;
    let mut tag_buf = String::new();
    let mut link_href: Option<String> = None;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag_buf.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let tag = tag_buf.trim().to_string();
                let lower = tag.to_ascii_lowercase();
                let closing = lower.starts_with('/');
                let name: String = lower
                    .trim_start_matches('/')
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect();

                if let Some(skipped) = skip_depth {
                    if closing && name == skipped {
                        skip_depth = None;
                    }
                    continue;
                }

                match (name.as_str(), closing) {
                    ("script", false) => skip_depth = Some("script"),
                    ("style", false) => skip_depth = Some("style"),
                    ("noscript", false) => skip_depth = Some("noscript"),
                    ("title", false) => in_title = true,
                    ("title", true) => in_title = false,
                    ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", false) => {
                        out.push('\n');
                        if markdown {
                            let level = name[1..].parse::<usize>().unwrap_or(1);
                            out.push_str(&"#".repeat(level));
                            out.push(' ');
                        }
                    }
                    ("li", false) => out.push_str(if markdown { "\n- " } else { "\n" }),
                    ("a", false) if markdown => {
                        link_href = attr_value(&tag, "href");
                        if link_href.is_some() {
                            out.push('[');
                        }
                    }
                    ("a", true) if markdown => {
                        if let Some(href) = link_href.take() {
                            out.push_str("](");
                            out.push_str(&href);
                            out.push(')');
                        }
                    }
                    ("br" | "hr", _) => out.push('\n'),
                    (
                        "p" | "div" | "section" | "article" | "header" | "footer" | "blockquote"
                        | "tr" | "table" | "ul" | "ol" | "pre",
                        true,
                    ) => out.push_str("\n\n"),
                    ("h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li", true) => out.push('\n'),
                    _ => {}
                }
                tag_buf.clear();
            }
            _ if in_tag => tag_buf.push(ch),
            _ if skip_depth.is_some() => {}
            _ if in_title => title.push(ch),
            _ => out.push(ch),
        }
    }

    let body = normalize_whitespace(&decode_entities(&out));
    let title = normalize_whitespace(&decode_entities(&title));
    match (title.is_empty(), markdown) {
        (true, _) => body,
        (false, true) => format!("# {title}\n\n{body}"),
        (false, false) => format!("{title}\n\n{body}"),
    }
}

fn attr_value(tag: &str, attr: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{attr}=");
    let start = lower.find(&needle)? + needle.len();
    let rest = &tag[start..];
    let value = match rest.chars().next()? {
        q @ ('"' | '\'') => rest[1..].split(q).next()?,
        _ => rest.split(|c: char| c.is_whitespace()).next()?,
    };
    let value = value.trim();
    (!value.is_empty()).then(|| decode_entities(value))
}

fn decode_entities(s: &str) -> String {
    let s = s
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ");
    // last, so "&amp;lt;" stays "&lt;"
    s.replace("&amp;", "&")
}

/// Collapse runs of spaces within lines and runs of blank lines.
fn normalize_whitespace(s: &str) -> String {
    let mut result = String::new();
    let mut prev_blank = false;
    for line in s.lines() {
        let trimmed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if trimmed.is_empty() {
            if !prev_blank {
                result.push('\n');
                prev_blank = true;
            }
        } else {
            result.push_str(&trimmed);
            result.push('\n');
            prev_blank = false;
        }
    }
    result.trim().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// web_search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: BraveWeb,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: Option<String>,
}

pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
    max_results: usize,
    timeout: Duration,
}

impl WebSearchTool {
    pub fn from_config(cfg: &WebConfig) -> na_domain::Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| na_domain::Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_key: cfg.search_api_key.clone().filter(|k| !k.is_empty()),
            max_results: cfg.search_max_results,
            timeout,
        })
    }

    fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("BRAVE_API_KEY").ok().filter(|k| !k.is_empty()))
    }
}

#[async_trait::async_trait]
impl ToolInvoker for WebSearchTool {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> InvokeResult {
        let req: SearchRequest = parse_args(args)?;
        let Some(api_key) = self.api_key() else {
            return Err(ToolError::execution(
                "web search is not configured (set tools.web.search_api_key or BRAVE_API_KEY)",
            ));
        };
        let count = req.count.unwrap_or(self.max_results).clamp(1, 10);
        let count_param = count.to_string();

        let resp = self
            .client
            .get(BRAVE_SEARCH_URL)
            .query(&[("q", req.query.as_str()), ("count", count_param.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::timeout("web search timed out")
                } else {
                    ToolError::execution(format!("web search failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ToolError::execution(format!("web search returned HTTP {status}")));
        }
        let body: BraveResponse = resp
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("invalid search response: {e}")))?;

        Ok(ToolOutput::text(format_results(&req.query, &body.web.results, count)))
    }
}

impl BuiltinTool for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "web_search".into(),
            description: "Search the web. Returns titles, URLs and snippets.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "count": { "type": "integer", "minimum": 1, "maximum": 10, "description": "Number of results" }
                },
                "required": ["query"]
            }),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout + Duration::from_secs(5)
    }
}

fn format_results(query: &str, results: &[BraveResult], count: usize) -> String {
    if results.is_empty() {
        return format!("No results for: {query}");
    }
    let mut lines = vec![format!("Results for: {query}\n")];
    for (i, item) in results.iter().take(count).enumerate() {
        lines.push(format!("{}. {}\n   {}", i + 1, item.title, strip_userinfo(&item.url)));
        if let Some(desc) = item.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("   {desc}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use na_domain::ErrorKind;

    const PAGE: &str = r#"<!DOCTYPE html><html><head><title>Rust &amp; Friends</title>
        <style>body { color: red; }</style><script>var secret = 1;</script></head>
        <body><h1>Intro</h1><p>Hello <a href="https://example.com/docs">the docs</a>.</p>
        <ul><li>one</li><li>two</li></ul></body></html>"#;

    #[test]
    fn markdown_keeps_structure() {
        let md = html_to_readable(PAGE, ExtractMode::Markdown);
        assert!(md.starts_with("# Rust & Friends\n\n"));
        assert!(md.contains("# Intro"));
        assert!(md.contains("[the docs](https://example.com/docs)"));
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
        assert!(!md.contains("secret"));
        assert!(!md.contains("color: red"));
    }

    #[test]
    fn text_mode_drops_markup() {
        let text = html_to_readable(PAGE, ExtractMode::Text);
        assert!(text.starts_with("Rust & Friends"));
        assert!(text.contains("Hello the docs."));
        assert!(!text.contains('#'));
        assert!(!text.contains("]("));
    }

    #[test]
    fn search_results_are_numbered() {
        let results = vec![
            BraveResult {
                title: "Rust".into(),
                url: "https://www.rust-lang.org/".into(),
                description: Some("A language".into()),
            },
            BraveResult {
                title: "Crates".into(),
                url: "https://crates.io/".into(),
                description: None,
            },
        ];
        let text = format_results("rust", &results, 5);
        assert_eq!(
            text,
            "Results for: rust\n\n1. Rust\n   https://www.rust-lang.org/\n   A language\n2. Crates\n   https://crates.io/"
        );
        assert_eq!(format_results("zzz", &[], 5), "No results for: zzz");
    }

    #[tokio::test]
    async fn fetch_of_private_target_is_a_sandbox_violation() {
        let tool = WebFetchTool::new(Arc::new(WebPolicy::from_config(&WebConfig::default())), 1000);
        let err = tool
            .invoke(&ToolContext::default(), json!({"url": "http://169.254.169.254/latest/meta-data"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxViolation);
    }

    #[tokio::test]
    async fn fetch_extracts_html_from_a_local_page() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{PAGE}",
                PAGE.len()
            );
            let _ = sock.write_all(resp.as_bytes()).await;
        });

        let policy = WebPolicy::from_config(&WebConfig::default()).with_ip_filter(|_| false);
        let tool = WebFetchTool::new(Arc::new(policy), 50_000);
        let out = tool
            .invoke(
                &ToolContext::default(),
                json!({"url": format!("http://bob:pw@127.0.0.1:{port}/page")}),
            )
            .await
            .unwrap();
        assert_eq!(out.payload["status"], 200);
        assert_eq!(out.payload["extractor"], "html");
        assert_eq!(out.payload["url"], format!("http://127.0.0.1:{port}/page"));
        assert!(out.payload["text"].as_str().unwrap().contains("# Intro"));
    }
}
