// src/core/adapters/email_policy.rs

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use tracing::{debug, info, warn};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::knowledge_base::{FindingDetail, get_finding_detail};
use crate::core::models::Phase;

/// Checks the SPF and DMARC records of the target domain.
pub struct EmailPolicyAdapter;

impl EmailPolicyAdapter {
    pub const ID: &'static str = "email-policy";
}

#[async_trait]
impl ToolAdapter for EmailPolicyAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::VulnScanning]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        info!(target = %ctx.target, "Starting email policy check.");
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let dmarc_name = format!("_dmarc.{}", ctx.target);

        let lookups = async {
            tokio::join!(
                txt_record(&resolver, &ctx.target, "v=spf1"),
                txt_record(&resolver, &dmarc_name, "v=DMARC1"),
            )
        };
        let (spf, dmarc) = tokio::select! {
            _ = ctx.cancel.cancelled() => return AdapterOutcome::failure(AdapterError::Cancelled),
            results = lookups => results,
        };

        let (spf, dmarc) = match (spf, dmarc) {
            (Ok(spf), Ok(dmarc)) => (spf, dmarc),
            (Err(e), _) | (_, Err(e)) => {
                warn!(target = %ctx.target, error = %e, "TXT lookup failed.");
                return AdapterOutcome::failure(AdapterError::Network(e.to_string()));
            }
        };

        let findings: Vec<RawItem> = analyze(spf.as_deref(), dmarc.as_deref())
            .into_iter()
            .map(|detail| RawItem::Finding(detail.raw(&ctx.target, None)))
            .collect();
        info!(target = %ctx.target, findings = findings.len(), "Email policy check finished.");
        AdapterOutcome::Success(findings)
    }
}

/// First TXT record at `name` starting with `prefix`. A name without TXT
/// records is a valid answer, not an error.
async fn txt_record(resolver: &TokioAsyncResolver, name: &str, prefix: &str) -> Result<Option<String>, ResolveError> {
    match resolver.txt_lookup(name).await {
        Ok(records) => {
            let found = records.iter().map(|r| r.to_string()).find(|r| r.starts_with(prefix));
            debug!(name, found = found.is_some(), "TXT lookup answered.");
            Ok(found)
        }
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Maps the published policies to catalog findings.
pub fn analyze(spf: Option<&str>, dmarc: Option<&str>) -> Vec<&'static FindingDetail> {
    let mut codes = Vec::new();
    match spf.map(str::trim) {
        None => codes.push("EMAIL_SPF_MISSING"),
        Some(record) if record.ends_with("~all") => codes.push("EMAIL_SPF_SOFTFAIL"),
        Some(record) if record.ends_with("?all") => codes.push("EMAIL_SPF_NEUTRAL"),
        Some(_) => {}
    }
    match dmarc {
        None => codes.push("EMAIL_DMARC_MISSING"),
        Some(record) if dmarc_policy(record).as_deref() == Some("none") => codes.push("EMAIL_DMARC_POLICY_NONE"),
        Some(_) => {}
    }
    codes.into_iter().filter_map(get_finding_detail).collect()
}

fn dmarc_policy(record: &str) -> Option<String> {
    record
        .split(';')
        .map(str::trim)
        .find_map(|tag| tag.strip_prefix("p="))
        .map(|p| p.trim().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(spf: Option<&str>, dmarc: Option<&str>) -> Vec<&'static str> {
        analyze(spf, dmarc).iter().map(|d| d.code).collect()
    }

    #[test]
    fn flags_missing_records() {
        assert_eq!(codes(None, None), vec!["EMAIL_SPF_MISSING", "EMAIL_DMARC_MISSING"]);
    }

    #[test]
    fn flags_weak_policies() {
        assert_eq!(
            codes(Some("v=spf1 include:_spf.example.net ~all"), Some("v=DMARC1; p=none; rua=mailto:d@example.com")),
            vec!["EMAIL_SPF_SOFTFAIL", "EMAIL_DMARC_POLICY_NONE"]
        );
        assert_eq!(codes(Some("v=spf1 ?all"), Some("v=DMARC1; p=reject")), vec!["EMAIL_SPF_NEUTRAL"]);
    }

    #[test]
    fn strict_policies_are_clean() {
        assert!(codes(Some("v=spf1 mx -all"), Some("v=DMARC1; p=Quarantine")).is_empty());
    }
}
