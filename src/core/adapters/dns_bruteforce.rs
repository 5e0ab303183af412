// src/core/adapters/dns_bruteforce.rs

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::models::Phase;

/// Labels tried under the target domain.
pub const COMMON_SUBDOMAINS: &[&str] = &[
    "www", "mail", "ftp", "admin", "api", "dev", "test", "staging", "blog", "shop", "app", "mobile", "secure", "vpn",
    "remote",
];

/// Resolves `<word>.<target>` for a fixed word list and reports every name
/// that has an address record.
pub struct DnsBruteforceAdapter {
    words: Vec<String>,
}

impl DnsBruteforceAdapter {
    pub const ID: &'static str = "dns-bruteforce";

    pub fn new() -> Self {
        Self::with_words(COMMON_SUBDOMAINS.iter().map(|w| w.to_string()).collect())
    }

    pub fn with_words(words: Vec<String>) -> Self {
        Self { words }
    }

    /// Candidate names for `target`, in word-list order.
    pub fn candidates(&self, target: &str) -> Vec<String> {
        self.words.iter().map(|w| format!("{w}.{target}")).collect()
    }
}

impl Default for DnsBruteforceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for DnsBruteforceAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Discovery]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        info!(target = %ctx.target, words = self.words.len(), "Starting DNS brute-force.");
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        let mut lookups = JoinSet::new();
        for name in self.candidates(&ctx.target) {
            let resolver = resolver.clone();
            lookups.spawn(async move {
                let found = resolver.lookup_ip(name.as_str()).await.map(|ips| ips.iter().next().is_some());
                (name, found)
            });
        }

        let mut resolved = Vec::new();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    lookups.abort_all();
                    return AdapterOutcome::failure(AdapterError::Cancelled);
                }
                next = lookups.join_next() => match next {
                    Some(Ok((name, Ok(true)))) => {
                        debug!(host = %name, "Subdomain resolved.");
                        resolved.push(RawItem::Hostname(name));
                    }
                    Some(Ok((name, Ok(false)))) => debug!(host = %name, "No addresses."),
                    Some(Ok((name, Err(e)))) => debug!(host = %name, error = %e, "Lookup failed."),
                    Some(Err(e)) => debug!(error = %e, "Lookup task failed."),
                    None => break,
                },
            }
        }

        info!(target = %ctx.target, found = resolved.len(), "DNS brute-force finished.");
        AdapterOutcome::Success(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_candidates_under_target() {
        let adapter = DnsBruteforceAdapter::with_words(vec!["www".into(), "api".into()]);
        assert_eq!(adapter.candidates("example.com"), vec!["www.example.com", "api.example.com"]);
        assert_eq!(DnsBruteforceAdapter::new().candidates("example.com").len(), COMMON_SUBDOMAINS.len());
    }
}
