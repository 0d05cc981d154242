//! Network confinement for outbound fetches.
//!
//! Every hop is resolved first and rejected if any address is private,
//! loopback, link-local, multicast or otherwise reserved. The validated
//! addresses are pinned into the client for that hop, so the connection
//! cannot be re-resolved somewhere else. Redirects are followed by hand.

use futures_util::StreamExt;
use na_domain::config::WebConfig;
use na_domain::error::ToolError;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;
use url::{Host, Url};

pub const USER_AGENT: &str = "nanoagent/0.1 (+web_fetch)";

const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// One fetched document after the redirect chain.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: Url,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// The body hit the byte cap and was cut.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct WebPolicy {
    blocked_hosts: Vec<String>,
    max_redirects: usize,
    max_bytes: usize,
    timeout: Duration,
    ip_filter: fn(IpAddr) -> bool,
}

impl WebPolicy {
    pub fn from_config(cfg: &WebConfig) -> Self {
        Self {
            blocked_hosts: cfg
                .blocked_hosts
                .iter()
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            max_redirects: cfg.max_redirects,
            max_bytes: cfg.max_bytes,
            timeout: Duration::from_secs(cfg.timeout_secs),
            ip_filter: is_blocked_ip,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the address filter. Only tests that need a loopback server
    /// use this.
    #[cfg(test)]
    pub(crate) fn with_ip_filter(mut self, filter: fn(IpAddr) -> bool) -> Self {
        self.ip_filter = filter;
        self
    }

    /// Parse a URL and apply the checks that need no network.
    pub fn parse_url(&self, raw: &str) -> Result<Url, ToolError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ToolError::validation(format!("invalid URL: {e}")))?;
        self.check_static(&url)?;
        Ok(url)
    }

    fn check_static(&self, url: &Url) -> Result<(), ToolError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::sandbox(format!(
                "only http/https URLs are allowed, got '{}'",
                url.scheme()
            )));
        }
        match url.host() {
            None => Err(ToolError::validation("URL has no host")),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain.ends_with(".localhost") || self.is_blocked_host(&domain) {
                    return Err(ToolError::sandbox(format!(
                        "host '{domain}' is blocked"
                    )));
                }
                Ok(())
            }
            Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip)),
        }
    }

    fn is_blocked_host(&self, domain: &str) -> bool {
        self.blocked_hosts.iter().any(|b| {
            domain == b
                || domain
                    .strip_suffix(b.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), ToolError> {
        if (self.ip_filter)(ip) {
            Err(ToolError::sandbox(format!(
                "address {ip} is in a private or reserved range"
            )))
        } else {
            Ok(())
        }
    }

    /// Resolve the URL's host and validate every address it maps to.
    pub async fn resolve(&self, url: &Url) -> Result<Vec<SocketAddr>, ToolError> {
        self.check_static(url)?;
        let port = url.port_or_known_default().unwrap_or(80);
        match url.host() {
            Some(Host::Ipv4(ip)) => Ok(vec![SocketAddr::new(IpAddr::V4(ip), port)]),
            Some(Host::Ipv6(ip)) => Ok(vec![SocketAddr::new(IpAddr::V6(ip), port)]),
            Some(Host::Domain(domain)) => {
                let lookup = tokio::net::lookup_host((domain, port));
                let addrs: Vec<SocketAddr> = match tokio::time::timeout(DNS_TIMEOUT, lookup).await
                {
                    Ok(Ok(iter)) => iter.collect(),
                    Ok(Err(e)) => {
                        return Err(ToolError::sandbox(format!(
                            "cannot resolve '{domain}': {e}"
                        )))
                    }
                    Err(_) => {
                        return Err(ToolError::sandbox(format!(
                            "DNS lookup for '{domain}' timed out"
                        )))
                    }
                };
                if addrs.is_empty() {
                    return Err(ToolError::sandbox(format!(
                        "'{domain}' resolved to no addresses"
                    )));
                }
                for addr in &addrs {
                    self.check_ip(addr.ip()).map_err(|_| {
                        ToolError::sandbox(format!(
                            "'{domain}' resolves to {} which is in a private or reserved range",
                            addr.ip()
                        ))
                    })?;
                }
                Ok(addrs)
            }
            None => Err(ToolError::validation("URL has no host")),
        }
    }

    fn client_for(&self, url: &Url, addrs: &[SocketAddr]) -> Result<reqwest::Client, ToolError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);
        if let Some(Host::Domain(domain)) = url.host() {
            builder = builder.resolve_to_addrs(domain, addrs);
        }
        builder
            .build()
            .map_err(|e| ToolError::execution(format!("failed to build HTTP client: {e}")))
    }

    /// GET a URL under the policy, following at most `max_redirects`
    /// redirects and reading at most `max_bytes` of body.
    pub async fn fetch(&self, raw_url: &str, accept: &str) -> Result<FetchedPage, ToolError> {
        let mut current = self.parse_url(raw_url)?;
        let mut redirects = 0usize;

        loop {
            let addrs = self.resolve(&current).await?;
            let client = self.client_for(&current, &addrs)?;
            let resp = client
                .get(current.clone())
                .header(ACCEPT, accept)
                .send()
                .await
                .map_err(|e| request_error(&current, e))?;

            let status = resp.status();
            if status.is_redirection() {
                if let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        return Err(ToolError::execution(format!(
                            "too many redirects (max {})",
                            self.max_redirects
                        )));
                    }
                    let next = current.join(location).map_err(|e| {
                        ToolError::execution(format!("invalid redirect location '{location}': {e}"))
                    })?;
                    tracing::debug!(
                        from = %strip_userinfo(current.as_str()),
                        to = %strip_userinfo(next.as_str()),
                        "following redirect"
                    );
                    current = next;
                    continue;
                }
            }

            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let mut stream = resp.bytes_stream();
            let mut body: Vec<u8> = Vec::new();
            let mut truncated = false;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| request_error(&current, e))?;
                let room = self.max_bytes.saturating_sub(body.len());
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                body.extend_from_slice(&chunk);
            }

            return Ok(FetchedPage {
                final_url: current,
                status: status.as_u16(),
                content_type,
                body,
                truncated,
            });
        }
    }
}

fn request_error(url: &Url, e: reqwest::Error) -> ToolError {
    let url = strip_userinfo(url.as_str());
    if e.is_timeout() {
        ToolError::timeout(format!("request to {url} timed out"))
    } else {
        ToolError::execution(format!("request to {url} failed: {e}"))
    }
}

// ── Address classification ──────────────────────────────────────────

/// Whether an address must never be the target of an outbound fetch.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        // carrier-grade NAT 100.64.0.0/10
        || (a == 100 && (b & 0xc0) == 64)
        // IETF protocol assignments 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // benchmarking 198.18.0.0/15
        || (a == 198 && (b & 0xfe) == 18)
        // reserved 240.0.0.0/4
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_blocked_v4(mapped);
    }
    let segs = ip.segments();
    // NAT64 64:ff9b::/96 embeds an IPv4 address
    if segs[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let [a, b] = segs[6].to_be_bytes();
        let [c, d] = segs[7].to_be_bytes();
        return is_blocked_v4(Ipv4Addr::new(a, b, c, d));
    }
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique local fc00::/7
        || (segs[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10 and deprecated site-local fec0::/10
        || (segs[0] & 0xffc0) == 0xfe80
        || (segs[0] & 0xffc0) == 0xfec0
        // documentation 2001:db8::/32
        || (segs[0] == 0x2001 && segs[1] == 0x0db8)
        // IPv4-compatible ::/96
        || segs[..6] == [0, 0, 0, 0, 0, 0]
}

// ── URL redaction ───────────────────────────────────────────────────

/// Remove `user:password@` from a URL before it is shown to the model.
pub fn strip_userinfo(raw: &str) -> String {
    if let Ok(mut url) = Url::parse(raw) {
        if url.username().is_empty() && url.password().is_none() {
            return url.to_string();
        }
        if url.set_username("").is_ok() && url.set_password(None).is_ok() {
            return url.to_string();
        }
    }
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    match RE
        .get_or_init(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/@\s]+@").ok())
        .as_ref()
    {
        Some(re) => re.replace_all(raw, "$1").into_owned(),
        None => raw.to_string(),
    }
}
