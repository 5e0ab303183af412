// src/core/adapters/tls_certificate.rs

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use thiserror::Error;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};
use x509_parser::prelude::*;

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::knowledge_base::{FindingDetail, get_finding_detail};
use crate::core::models::{AssetGraph, Phase};

const TLS_PORT: u16 = 443;
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Validity window of a certificate, as read off the wire.
#[derive(Debug, Clone, Copy)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// What the handshake against one host produced.
#[derive(Debug)]
enum Handshake {
    /// A trusted session was established.
    Trusted(Option<Validity>),
    /// Only an unverified session was possible; carries the certificate if one was served.
    Untrusted(Option<Validity>),
}

/// Why no TLS session was established.
#[derive(Debug, Error)]
enum SessionError {
    /// Nothing answered on the port, so there is no TLS endpoint to judge.
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("{0}")]
    Tls(String),
}

/// A host to check. `confirmed` is false when no service is known for the
/// host and port 443 is only assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsTarget {
    pub host: String,
    pub confirmed: bool,
}

/// Hosts with a known 443 service, plus hosts with no known service at all.
/// The latter is what a vulnerability-only scan sees, since no port scan fed it.
pub fn tls_targets(assets: &AssetGraph, hosts: &[String]) -> Vec<TlsTarget> {
    hosts
        .iter()
        .filter_map(|host| {
            let mut services = assets.services_for(host).peekable();
            if services.peek().is_none() {
                return Some(TlsTarget { host: host.clone(), confirmed: false });
            }
            services
                .any(|s| s.port == TLS_PORT)
                .then(|| TlsTarget { host: host.clone(), confirmed: true })
        })
        .collect()
}

/// Performs a TLS handshake on port 443 of every host with an open 443
/// service, or of every host without known services.
pub struct TlsCertificateAdapter {
    io_timeout: Duration,
}

impl TlsCertificateAdapter {
    pub const ID: &'static str = "tls-certificate";

    pub fn new() -> Self {
        Self { io_timeout: Duration::from_secs(10) }
    }
}

impl Default for TlsCertificateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for TlsCertificateAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::VulnScanning]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        let targets = tls_targets(&ctx.assets, &ctx.hosts());
        info!(hosts = targets.len(), "Starting TLS certificate check.");

        let mut findings = Vec::new();
        for TlsTarget { host, confirmed } in targets {
            let io_timeout = self.io_timeout.min(ctx.remaining());
            let tls_host = host.clone();
            // native-tls is blocking, so the handshake runs on the blocking pool.
            let session = spawn_blocking(move || handshake(&tls_host, io_timeout));
            let handshake = tokio::select! {
                _ = ctx.cancel.cancelled() => return AdapterOutcome::failure(AdapterError::Cancelled),
                joined = session => match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!(host = %host, panic = %e, "TLS handshake task failed.");
                        return AdapterOutcome::failure(AdapterError::Panicked(e.to_string()));
                    }
                },
            };
            let detail = match handshake {
                Ok(result) => assess(&result, Utc::now()),
                Err(SessionError::Unreachable(e)) if !confirmed => {
                    debug!(host = %host, error = %e, "No TLS listener on an unscanned host.");
                    None
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "No TLS session possible.");
                    get_finding_detail("TLS_HANDSHAKE_FAILED")
                }
            };
            if let Some(detail) = detail {
                findings.push(RawItem::Finding(detail.raw(&host, Some(TLS_PORT))));
            }
        }

        info!(findings = findings.len(), "TLS certificate check finished.");
        AdapterOutcome::Success(findings)
    }
}

fn assess(handshake: &Handshake, now: DateTime<Utc>) -> Option<&'static FindingDetail> {
    let code = match handshake {
        Handshake::Trusted(Some(validity)) => {
            let days_left = (validity.not_after - now).num_days();
            (days_left <= EXPIRY_WARNING_DAYS).then_some("TLS_CERT_EXPIRING")?
        }
        Handshake::Trusted(None) => return None,
        Handshake::Untrusted(Some(validity)) if now > validity.not_after || now < validity.not_before => {
            "TLS_CERT_EXPIRED"
        }
        Handshake::Untrusted(_) => "TLS_HANDSHAKE_FAILED",
    };
    get_finding_detail(code)
}

/// Tries a verified handshake first; when that fails, retries without
/// verification to find out whether the certificate itself is the problem.
fn handshake(host: &str, io_timeout: Duration) -> Result<Handshake, SessionError> {
    let verified = TlsConnector::new().map_err(|e| SessionError::Tls(format!("TlsConnector error: {e}")))?;
    match connect(&verified, host, io_timeout) {
        Ok(validity) => Ok(Handshake::Trusted(validity)),
        Err(unreachable @ SessionError::Unreachable(_)) => Err(unreachable),
        Err(verified_err) => {
            debug!(host, error = %verified_err, "Verified handshake failed, retrying unverified.");
            let unverified = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| SessionError::Tls(format!("TlsConnector error: {e}")))?;
            connect(&unverified, host, io_timeout).map(Handshake::Untrusted)
        }
    }
}

fn connect(connector: &TlsConnector, host: &str, io_timeout: Duration) -> Result<Option<Validity>, SessionError> {
    let addr = (host, TLS_PORT)
        .to_socket_addrs()
        .map_err(|e| SessionError::Unreachable(format!("resolve error: {e}")))?
        .next()
        .ok_or_else(|| SessionError::Unreachable(format!("{host} has no address")))?;
    let stream = TcpStream::connect_timeout(&addr, io_timeout)
        .map_err(|e| SessionError::Unreachable(format!("TCP connection error: {e}")))?;
    stream.set_read_timeout(Some(io_timeout)).map_err(|e| SessionError::Unreachable(e.to_string()))?;
    stream.set_write_timeout(Some(io_timeout)).map_err(|e| SessionError::Unreachable(e.to_string()))?;

    let stream =
        connector.connect(host, stream).map_err(|e| SessionError::Tls(format!("TLS handshake error: {e}")))?;
    read_validity(&stream).map_err(SessionError::Tls)
}

fn read_validity(stream: &native_tls::TlsStream<TcpStream>) -> Result<Option<Validity>, String> {
    let Some(cert) = stream.peer_certificate().map_err(|e| format!("peer certificate error: {e}"))? else {
        return Ok(None);
    };
    let der = cert.to_der().map_err(|e| format!("DER conversion error: {e}"))?;
    let (_, x509) = parse_x509_certificate(&der).map_err(|e| format!("X.509 parse error: {e}"))?;
    let validity = x509.validity();
    Ok(Some(Validity {
        not_before: asn1_to_utc(&validity.not_before),
        not_after: asn1_to_utc(&validity.not_after),
    }))
}

fn asn1_to_utc(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}
