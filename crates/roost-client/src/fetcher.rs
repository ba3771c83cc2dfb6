use std::net::IpAddr;
use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use roost_core::error::{AdapterError, AppError};
use roost_core::traits::Fetcher;
use url::Url;

/// Identifies the crawler as what it is rather than posing as a browser.
pub const USER_AGENT: &str = concat!(
    "Roost/",
    env!("CARGO_PKG_VERSION"),
    " (real-estate listing aggregator)"
);

/// HTTP fetcher using reqwest.
///
/// Downloads raw HTML with an honest User-Agent and a per-request timeout,
/// and maps HTTP outcomes onto [`AdapterError`]: 429 becomes
/// `RateLimited` (with the `Retry-After` hint when it is given in seconds),
/// 403 becomes `Blocked`, any other non-2xx becomes `HttpStatus`.
///
/// SSRF protection is **enabled** by default: requests to private/reserved
/// IP ranges are refused. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g. for tests against a local server).
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn transport_error(&self, e: reqwest::Error) -> AdapterError {
        if e.is_timeout() {
            AdapterError::Timeout(self.timeout)
        } else if e.is_connect() {
            AdapterError::Network(format!("Connection failed: {e}"))
        } else {
            AdapterError::Network(e.to_string())
        }
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AdapterError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::warn!(%url, ?retry_after, "Remote site rate limited request");
            return Err(AdapterError::RateLimited { retry_after });
        }
        if status == StatusCode::FORBIDDEN {
            return Err(AdapterError::Blocked(format!("HTTP 403 for {url}")));
        }
        if !status.is_success() {
            return Err(AdapterError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout(self.timeout)
            } else {
                AdapterError::Network(format!("Failed to read response body: {e}"))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AdapterError> {
    let parsed = Url::parse(url).map_err(|e| AdapterError::Other(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AdapterError::Other(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AdapterError::Other("URL has no host".to_string()))?;

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AdapterError::Other(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AdapterError::Network(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AdapterError::Network(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(private) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AdapterError::Other(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            private.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // CGN
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
