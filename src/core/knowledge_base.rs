//! Static catalog of the findings the built-in adapters can report.
//!
//! Adapters only decide *that* something is wrong; titles, severities and
//! remediation advice live here so they read consistently across tools.

use std::fmt;

use crate::core::adapter::RawFinding;
use crate::core::models::{Severity, Transport};

/// High-level grouping used for the finding's `category` field and the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FindingCategory {
    /// Mail authentication records (SPF, DMARC).
    Email,
    /// Certificates and the TLS handshake.
    Tls,
    /// HTTP response hardening.
    Http,
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindingCategory::Email => write!(f, "Email Policy"),
            FindingCategory::Tls => write!(f, "TLS Certificate"),
            FindingCategory::Http => write!(f, "Missing Security Header"),
        }
    }
}

/// Everything needed to present one kind of finding.
pub struct FindingDetail {
    /// Machine-readable code, e.g. `EMAIL_DMARC_MISSING`.
    pub code: &'static str,
    pub title: &'static str,
    pub category: FindingCategory,
    pub severity: Severity,
    /// Cross-tool equivalence key. Two tools reporting the same fingerprint on
    /// the same host and port describe the same problem.
    pub fingerprint: &'static str,
    pub description: &'static str,
    pub remediation: &'static str,
}

impl FindingDetail {
    /// Builds the raw finding an adapter reports for `host` (and optionally a port).
    pub fn raw(&self, host: &str, port: Option<u16>) -> RawFinding {
        RawFinding {
            host: host.to_string(),
            port,
            transport: port.map(|_| Transport::Tcp),
            severity: self.severity,
            category: self.category.to_string(),
            title: self.title.to_string(),
            description: self.description.to_string(),
            fingerprint: Some(self.fingerprint.to_string()),
        }
    }
}

static FINDINGS: &[FindingDetail] = &[
    // --- Email authentication ---
    FindingDetail {
        code: "EMAIL_SPF_MISSING",
        title: "No SPF record",
        category: FindingCategory::Email,
        severity: Severity::Medium,
        fingerprint: "email:spf-missing",
        description: "The domain publishes no SPF policy, so receiving mail servers cannot tell which hosts may send mail in its name.",
        remediation: "Publish a TXT record starting with 'v=spf1' that lists the mail servers of the domain and ends with '-all'.",
    },
    FindingDetail {
        code: "EMAIL_SPF_SOFTFAIL",
        title: "SPF ends in softfail",
        category: FindingCategory::Email,
        severity: Severity::Low,
        fingerprint: "email:spf-softfail",
        description: "The SPF policy ends in '~all': mail from unlisted servers is accepted and merely tagged.",
        remediation: "Once every legitimate sender is listed, switch the qualifier to '-all'.",
    },
    FindingDetail {
        code: "EMAIL_SPF_NEUTRAL",
        title: "SPF ends in neutral",
        category: FindingCategory::Email,
        severity: Severity::Low,
        fingerprint: "email:spf-neutral",
        description: "The SPF policy ends in '?all', which makes no statement about unlisted senders at all.",
        remediation: "Replace '?all' with '-all', or '~all' while the sender list is still being audited.",
    },
    FindingDetail {
        code: "EMAIL_DMARC_MISSING",
        title: "No DMARC record",
        category: FindingCategory::Email,
        severity: Severity::High,
        fingerprint: "email:dmarc-missing",
        description: "No TXT record exists at _dmarc. Receivers get no instruction for mail that fails SPF or DKIM, which leaves the domain open to spoofing.",
        remediation: "Publish 'v=DMARC1; p=none; rua=mailto:<reports address>' at _dmarc, review the aggregate reports, then tighten to quarantine or reject.",
    },
    FindingDetail {
        code: "EMAIL_DMARC_POLICY_NONE",
        title: "DMARC policy is monitor-only",
        category: FindingCategory::Email,
        severity: Severity::Medium,
        fingerprint: "email:dmarc-policy-none",
        description: "The DMARC record uses 'p=none': failures are reported but spoofed mail is still delivered.",
        remediation: "Move to 'p=quarantine' and then 'p=reject' once legitimate mail passes alignment.",
    },
    // --- TLS ---
    FindingDetail {
        code: "TLS_HANDSHAKE_FAILED",
        title: "TLS handshake failed",
        category: FindingCategory::Tls,
        severity: Severity::High,
        fingerprint: "tls:handshake-failed",
        description: "Port 443 accepted the connection but a trusted TLS session could not be negotiated. Typical causes are an untrusted chain, a hostname mismatch or an obsolete protocol.",
        remediation: "Install a certificate from a public CA that covers this hostname, serve the full chain and enable TLS 1.2 or later.",
    },
    FindingDetail {
        code: "TLS_CERT_EXPIRED",
        title: "Certificate expired",
        category: FindingCategory::Tls,
        severity: Severity::High,
        fingerprint: "tls:cert-expired",
        description: "The certificate served on port 443 is outside its validity window. Browsers block the site behind an interstitial warning.",
        remediation: "Renew the certificate now and automate renewal (ACME) so it cannot lapse again.",
    },
    FindingDetail {
        code: "TLS_CERT_EXPIRING",
        title: "Certificate expires within 30 days",
        category: FindingCategory::Tls,
        severity: Severity::Medium,
        fingerprint: "tls:cert-expiring",
        description: "The certificate served on port 443 expires in less than 30 days.",
        remediation: "Renew ahead of expiry, and check that automated renewal is actually running.",
    },
    // --- HTTP headers ---
    FindingDetail {
        code: "HTTP_X_FRAME_OPTIONS_MISSING",
        title: "X-Frame-Options header missing",
        category: FindingCategory::Http,
        severity: Severity::Medium,
        fingerprint: "missing-header:x-frame-options",
        description: "Without X-Frame-Options (or a CSP frame-ancestors directive) pages can be embedded in a hostile frame for clickjacking.",
        remediation: "Send 'X-Frame-Options: DENY', or SAMEORIGIN when the site frames itself.",
    },
    FindingDetail {
        code: "HTTP_X_CONTENT_TYPE_OPTIONS_MISSING",
        title: "X-Content-Type-Options header missing",
        category: FindingCategory::Http,
        severity: Severity::Medium,
        fingerprint: "missing-header:x-content-type-options",
        description: "Browsers may MIME-sniff responses and execute uploaded content as script.",
        remediation: "Send 'X-Content-Type-Options: nosniff' on every response.",
    },
    FindingDetail {
        code: "HTTP_X_XSS_PROTECTION_MISSING",
        title: "X-XSS-Protection header missing",
        category: FindingCategory::Http,
        severity: Severity::Medium,
        fingerprint: "missing-header:x-xss-protection",
        description: "Legacy browsers fall back to their default reflected-XSS heuristics.",
        remediation: "Send 'X-XSS-Protection: 0' and rely on a Content-Security-Policy instead, or '1; mode=block' for legacy clients.",
    },
    FindingDetail {
        code: "HTTP_HSTS_MISSING",
        title: "Strict-Transport-Security header missing",
        category: FindingCategory::Http,
        severity: Severity::Medium,
        fingerprint: "missing-header:strict-transport-security",
        description: "Clients are not told to insist on HTTPS, so a network attacker can downgrade the first request to plain HTTP.",
        remediation: "Send 'Strict-Transport-Security: max-age=31536000; includeSubDomains' over HTTPS.",
    },
    FindingDetail {
        code: "HTTP_CSP_MISSING",
        title: "Content-Security-Policy header missing",
        category: FindingCategory::Http,
        severity: Severity::Medium,
        fingerprint: "missing-header:content-security-policy",
        description: "No policy restricts where scripts, styles and frames may load from, which widens the impact of any injection bug.",
        remediation: "Start with a report-only policy, then enforce a restrictive default-src once the reports are clean.",
    },
];

/// Looks up a finding by its code.
pub fn get_finding_detail(code: &str) -> Option<&'static FindingDetail> {
    FINDINGS.iter().find(|f| f.code == code)
}

/// Looks up the catalog entry for a missing HTTP header, by lowercase header name.
pub fn missing_header_detail(header: &str) -> Option<&'static FindingDetail> {
    FINDINGS
        .iter()
        .find(|f| f.fingerprint.strip_prefix("missing-header:") == Some(header))
}
