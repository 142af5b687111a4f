//! SSRF-hardened HTTP client behind the plugin `fetch` capability.
//!
//! Plugins fetch quota and balance data from their vendors' APIs, which
//! makes this client the host's biggest network attack surface. Every call
//! runs the same gauntlet, in order: URL parse, concurrency permit, bounded
//! DNS resolution, classification of every resolved address against the
//! private/reserved ranges, then a per-request client that pins the resolved
//! IP (so a rebinding resolver cannot redirect the connection), never
//! follows redirects, never uses a proxy, and streams the body against a
//! hard byte cap.
//!
//! The in-flight counter is a lock-free atomic; the permit guard releases
//! on every exit path including drops mid-stream.

use crate::error::{HostError, HostResult};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("quotabar/", env!("CARGO_PKG_VERSION"));

/// Request options accepted from the sandbox, mirroring the subset of the
/// web fetch init plugins may use.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
}

/// Response returned to the plugin.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Concurrency permits
// ---------------------------------------------------------------------------

/// RAII permit over the shared in-flight counter. Decrements exactly once,
/// and never below zero, on drop.
struct FetchPermit {
    counter: Arc<AtomicUsize>,
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct SecureFetch {
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    request_timeout: Duration,
    dns_timeout: Duration,
    max_response_bytes: u64,
    /// Set after the client builder fails twice; fetch stays off for the
    /// rest of the session instead of panicking per-request.
    disabled: AtomicBool,
    /// Test-only escape hatch so loopback test servers are reachable.
    allow_private: bool,
}

impl SecureFetch {
    pub fn new(
        max_in_flight: usize,
        request_timeout: Duration,
        dns_timeout: Duration,
        max_response_bytes: u64,
    ) -> Self {
        Self {
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            request_timeout,
            dns_timeout,
            max_response_bytes,
            disabled: AtomicBool::new(false),
            allow_private: false,
        }
    }

    pub fn from_config(config: &crate::config::HostConfig) -> Self {
        Self::new(
            config.max_in_flight_fetches,
            Duration::from_secs(config.fetch_timeout_secs),
            Duration::from_secs(config.dns_timeout_secs),
            config.max_response_bytes,
        )
    }

    #[cfg(test)]
    pub(crate) fn for_tests(max_in_flight: usize, max_response_bytes: u64) -> Self {
        let mut fetch = Self::new(
            max_in_flight,
            Duration::from_secs(5),
            Duration::from_secs(5),
            max_response_bytes,
        );
        fetch.allow_private = true;
        fetch
    }

    /// Current in-flight count. Exposed for supervision.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reset the counter. Test helper only; production code relies on
    /// permit drops and never resets.
    #[cfg(test)]
    pub(crate) fn reset_in_flight(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
    }

    fn acquire_permit(&self) -> HostResult<FetchPermit> {
        let max = self.max_in_flight;
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n >= max {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| HostError::TooManyRequests)?;
        Ok(FetchPermit {
            counter: Arc::clone(&self.in_flight),
        })
    }

    /// Perform a plugin HTTP request. See the module docs for the ordered
    /// hardening steps.
    pub async fn fetch(
        &self,
        plugin_id: &str,
        url_str: &str,
        options: FetchOptions,
    ) -> HostResult<FetchResponse> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(HostError::ClientNotInitialized);
        }

        // 1. Parse and gate the URL shape.
        let url = url::Url::parse(url_str).map_err(|e| HostError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(HostError::InvalidUrl(format!(
                    "scheme \"{scheme}\" is not allowed; use http or https"
                )))
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| HostError::InvalidUrl("url has no host".into()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HostError::InvalidUrl("url has no port".into()))?;

        let method = match options.method.as_deref().unwrap_or("GET") {
            m if m.eq_ignore_ascii_case("GET") => reqwest::Method::GET,
            m if m.eq_ignore_ascii_case("POST") => reqwest::Method::POST,
            other => return Err(HostError::UnsupportedApi(format!("http method {other}"))),
        };

        // 2. Take the concurrency permit before spending anything on DNS.
        let _permit = self.acquire_permit()?;

        // 3 & 4. Resolve within the DNS budget and classify every address.
        let addrs = self.resolve(&host, port).await?;
        if !self.allow_private {
            for addr in &addrs {
                if is_blocked_ip(addr.ip()) {
                    tracing::warn!(
                        plugin = plugin_id,
                        %host,
                        ip = %addr.ip(),
                        "blocked fetch to private or reserved address"
                    );
                    return Err(HostError::BlockedAddress(addr.ip()));
                }
            }
        }

        // 5. Per-request client pinned to the first resolved address.
        let pinned = addrs[0];
        let client = self.build_client(&host, pinned)?;

        // 6. Issue and stream.
        let mut request = client.request(method, url);
        if let Some(headers) = &options.headers {
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| HostError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        // Content-Length is only an early hint; the enforced cap below
        // counts written bytes.
        if let Some(declared) = response.content_length() {
            usize::try_from(declared).map_err(|_| HostError::ContentLengthOverflow(declared))?;
            if declared > self.max_response_bytes {
                return Err(HostError::ResponseTooLarge {
                    size: declared,
                    max: self.max_response_bytes,
                });
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| HostError::ReadError(e.to_string()))?;
            let would_be = body.len() as u64 + chunk.len() as u64;
            if would_be > self.max_response_bytes {
                return Err(HostError::ResponseTooLarge {
                    size: would_be,
                    max: self.max_response_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    /// Resolve a host within the DNS budget. An empty answer is an explicit
    /// error, never a silent fall-through.
    async fn resolve(&self, host: &str, port: u16) -> HostResult<Vec<SocketAddr>> {
        // IP literals skip the resolver but not classification.
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let lookup = tokio::net::lookup_host((host, port));
        let addrs: Vec<SocketAddr> = tokio::time::timeout(self.dns_timeout, lookup)
            .await
            .map_err(|_| HostError::DnsError(format!("resolution of \"{host}\" timed out")))?
            .map_err(|e| HostError::DnsError(format!("{host}: {e}")))?
            .collect();

        if addrs.is_empty() {
            return Err(HostError::DnsError(format!("no addresses for \"{host}\"")));
        }
        Ok(addrs)
    }

    /// Build the single-use client. Falls back once to a minimal hardened
    /// configuration; a second failure disables fetch for the session.
    fn build_client(&self, host: &str, pinned: SocketAddr) -> HostResult<reqwest::Client> {
        let full = reqwest::Client::builder()
            .resolve(host, pinned)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .timeout(self.request_timeout)
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(0)
            .tcp_nodelay(true)
            .build();

        match full {
            Ok(client) => Ok(client),
            Err(e) => {
                tracing::warn!("http client build failed, retrying minimal config: {e}");
                reqwest::Client::builder()
                    .resolve(host, pinned)
                    .redirect(reqwest::redirect::Policy::none())
                    .no_proxy()
                    .timeout(self.request_timeout)
                    .user_agent(USER_AGENT)
                    .build()
                    .map_err(|e| {
                        tracing::error!("http client unavailable, disabling fetch: {e}");
                        self.disabled.store(true, Ordering::SeqCst);
                        HostError::ClientNotInitialized
                    })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Address classification
// ---------------------------------------------------------------------------

/// True when connecting to this address could reach private infrastructure.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_multicast()
        || ip.is_broadcast()
        // CGNAT 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // "this network" 0.0.0.0/8
        || octets[0] == 0
        // reserved 240.0.0.0/4
        || octets[0] >= 240
        // IETF protocol assignments 192.0.0.0/24
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // benchmarking 198.18.0.0/15
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    // IPv4-mapped addresses are classified as their inner IPv4, and
    // blocked regardless, since well-behaved public services do not hand
    // them out over DNS.
    if ip.to_ipv4_mapped().is_some() {
        return true;
    }
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // unique-local fc00::/7
        || (segments[0] & 0xfe00) == 0xfc00
        // link-local fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // Teredo tunnelling 2001::/32
        || (segments[0] == 0x2001 && segments[1] == 0)
        // discard-only 100::/64
        || (segments[0] == 0x100 && segments[1] == 0 && segments[2] == 0 && segments[3] == 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
