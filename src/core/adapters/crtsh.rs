// src/core/adapters/crtsh.rs

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::models::Phase;

const CRTSH_URL: &str = "https://crt.sh/";

#[derive(Debug, Deserialize)]
struct CrtEntry {
    name_value: String,
}

/// Pulls subdomains out of certificate-transparency logs.
pub struct CrtshAdapter {
    client: reqwest::Client,
}

impl CrtshAdapter {
    pub const ID: &'static str = "crtsh";

    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn query(&self, ctx: &AdapterContext) -> Result<Vec<RawItem>, AdapterError> {
        let response = self
            .client
            .get(CRTSH_URL)
            .query(&[("q", format!("%.{}", ctx.target)), ("output", "json".to_string())])
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| AdapterError::Network(e.to_string()))?;

        if !response.status().is_success() {
            // crt.sh answers 502/503 under load; those are worth another try.
            return Err(AdapterError::Network(format!("crt.sh returned {}", response.status())));
        }
        let body = response.text().await.map_err(|e| AdapterError::Network(e.to_string()))?;
        parse_entries(&body)
    }
}

#[async_trait]
impl ToolAdapter for CrtshAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Discovery]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        info!(target = %ctx.target, "Querying certificate transparency logs.");
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AdapterError::Cancelled),
            result = self.query(&ctx) => result,
        };
        match result {
            Ok(items) => {
                info!(target = %ctx.target, names = items.len(), "Certificate transparency query finished.");
                AdapterOutcome::Success(items)
            }
            Err(e) => {
                warn!(target = %ctx.target, error = %e, "Certificate transparency query failed.");
                AdapterOutcome::failure(e)
            }
        }
    }
}

/// Splits the multi-line `name_value` fields of a crt.sh JSON answer into names.
/// Normalization and zone filtering happen later, during aggregation.
pub fn parse_entries(body: &str) -> Result<Vec<RawItem>, AdapterError> {
    let entries: Vec<CrtEntry> =
        serde_json::from_str(body).map_err(|e| AdapterError::MalformedOutput(format!("crt.sh: {e}")))?;
    let mut names: Vec<String> = entries
        .iter()
        .flat_map(|entry| entry.name_value.lines())
        .map(|name| name.trim().trim_start_matches("*.").to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    Ok(names.into_iter().map(RawItem::Hostname).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_strips_wildcards() {
        let body = r#"[
            {"issuer_name": "R3", "name_value": "example.com\nwww.example.com"},
            {"name_value": "*.api.example.com"},
            {"name_value": "www.example.com"}
        ]"#;
        let names: Vec<RawItem> = parse_entries(body).unwrap();
        assert_eq!(
            names,
            vec![
                RawItem::Hostname("api.example.com".into()),
                RawItem::Hostname("example.com".into()),
                RawItem::Hostname("www.example.com".into()),
            ]
        );
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(parse_entries("<html>busy</html>"), Err(AdapterError::MalformedOutput(_))));
    }
}
