// src/core/adapters/http_headers.rs

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::knowledge_base::missing_header_detail;
use crate::core::models::{AssetGraph, Phase};

/// Response headers every web endpoint is expected to send.
pub const SECURITY_HEADERS: &[&str] = &[
    "x-frame-options",
    "x-content-type-options",
    "x-xss-protection",
    "strict-transport-security",
    "content-security-policy",
];

/// One URL to fetch, and the port findings on it are attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub url: String,
}

/// Reports missing security headers on every web service.
pub struct HttpHeadersAdapter {
    client: reqwest::Client,
}

impl HttpHeadersAdapter {
    pub const ID: &'static str = "http-headers";

    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn check(&self, endpoint: &Endpoint, ctx: &AdapterContext) -> Result<Vec<RawItem>, AdapterError> {
        let response = self
            .client
            .get(&endpoint.url)
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;
        debug!(url = %endpoint.url, status = %response.status(), "Received HTTP response.");
        Ok(missing_headers(response.headers())
            .into_iter()
            .filter_map(missing_header_detail)
            .map(|detail| RawItem::Finding(detail.raw(&endpoint.host, Some(endpoint.port))))
            .collect())
    }
}

#[async_trait]
impl ToolAdapter for HttpHeadersAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::VulnScanning]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        let endpoints = endpoints(&ctx.assets, &ctx.hosts());
        info!(endpoints = endpoints.len(), "Starting security header check.");

        let mut findings = Vec::new();
        let mut last_error = None;
        let mut reached = 0;
        for endpoint in &endpoints {
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => return AdapterOutcome::failure(AdapterError::Cancelled),
                result = self.check(endpoint, &ctx) => result,
            };
            match result {
                Ok(items) => {
                    reached += 1;
                    findings.extend(items);
                }
                Err(e) => {
                    warn!(url = %endpoint.url, error = %e, "HTTP request failed.");
                    last_error = Some(e);
                }
            }
        }

        // Unreachable endpoints are expected; only a run that reached nothing is a failure.
        match last_error {
            Some(e) if reached == 0 => AdapterOutcome::failure(e),
            _ => {
                info!(reached, findings = findings.len(), "Security header check finished.");
                AdapterOutcome::Success(findings)
            }
        }
    }
}

/// Web endpoints derived from known services; hosts without any known service
/// are tried on plain `https://host`.
pub fn endpoints(assets: &AssetGraph, hosts: &[String]) -> Vec<Endpoint> {
    let mut endpoints = Vec::new();
    for host in hosts {
        let mut services = assets.services_for(host).peekable();
        if services.peek().is_none() {
            endpoints.push(Endpoint { host: host.clone(), port: 443, url: format!("https://{host}") });
            continue;
        }
        for service in services {
            let name = service.name.as_deref().unwrap_or_default();
            let scheme = match (service.port, name) {
                (443 | 8443, _) | (_, "https") => "https",
                (80 | 8080, _) | (_, "http") => "http",
                _ => continue,
            };
            endpoints.push(Endpoint {
                host: host.clone(),
                port: service.port,
                url: format!("{scheme}://{host}:{}", service.port),
            });
        }
    }
    endpoints
}

/// Security headers absent from `headers`, by lowercase name.
pub fn missing_headers(headers: &HeaderMap) -> Vec<&'static str> {
    SECURITY_HEADERS.iter().copied().filter(|name| !headers.contains_key(*name)).collect()
}
