// src/core/adapters/mod.rs

//! Adapters shipped with the crate, plus the external-command adapter that
//! wraps tools declared in the configuration file.

pub mod command;
pub mod crtsh;
pub mod dns_bruteforce;
pub mod email_policy;
pub mod http_headers;
pub mod tcp_connect;
pub mod tls_certificate;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Settings;
use crate::core::adapter::ToolAdapter;
use crate::core::registry::AdapterRegistry;

use command::CommandAdapter;
use crtsh::CrtshAdapter;
use dns_bruteforce::DnsBruteforceAdapter;
use email_policy::EmailPolicyAdapter;
use http_headers::HttpHeadersAdapter;
use tcp_connect::TcpConnectAdapter;
use tls_certificate::TlsCertificateAdapter;

const USER_AGENT: &str = "VanguardRecon/0.1";

/// Builds the registry for a run: built-ins minus the disabled ones, then
/// external tools, then the required flags.
pub fn default_registry(settings: &Settings) -> Result<AdapterRegistry, reqwest::Error> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let builtins: Vec<Arc<dyn ToolAdapter>> = vec![
        Arc::new(DnsBruteforceAdapter::new()),
        Arc::new(CrtshAdapter::new(client.clone())),
        Arc::new(TcpConnectAdapter::new()),
        Arc::new(HttpHeadersAdapter::new(client)),
        Arc::new(EmailPolicyAdapter),
        Arc::new(TlsCertificateAdapter::new()),
    ];
    let external = settings
        .external_tools
        .iter()
        .map(|spec| Arc::new(CommandAdapter::new(spec.clone())) as Arc<dyn ToolAdapter>);

    let mut registry = AdapterRegistry::new();
    for adapter in builtins.into_iter().chain(external) {
        if settings.disabled_adapters.iter().any(|id| id == adapter.id()) {
            info!(adapter = adapter.id(), "Adapter disabled by configuration.");
            continue;
        }
        registry.register(adapter);
    }
    for id in &settings.required_adapters {
        if !registry.contains(id) {
            warn!(adapter = %id, "Required adapter is not registered.");
        }
        registry.require(id);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapters::command::{ExternalToolSpec, OutputFormat};
    use crate::core::models::Phase;

    #[test]
    fn honours_disabled_required_and_external() {
        let settings = Settings {
            disabled_adapters: vec!["crtsh".into(), "tls-certificate".into()],
            required_adapters: vec!["amass".into()],
            external_tools: vec![ExternalToolSpec {
                id: "amass".into(),
                phase: Phase::Discovery,
                program: "amass".into(),
                args: vec!["enum".into(), "-d".into(), "{target}".into()],
                output: OutputFormat::Hostnames,
                required: false,
            }],
            ..Settings::default()
        };
        let registry = default_registry(&settings).unwrap();

        assert_eq!(registry.list_ids(Phase::Discovery), vec!["dns-bruteforce", "amass"]);
        assert_eq!(registry.list_ids(Phase::PortScanning), vec!["tcp-connect"]);
        assert_eq!(registry.list_ids(Phase::VulnScanning), vec!["http-headers", "email-policy"]);
        assert_eq!(registry.required_for(Phase::Discovery), vec!["amass"]);
    }
}
