// src/core/adapters/tcp_connect.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawItem, RawService, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::models::{Phase, Transport};

/// Ports probed by default, with the service conventionally found there.
pub const COMMON_PORTS: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (443, "https"),
    (993, "imaps"),
    (995, "pop3s"),
    (3306, "mysql"),
    (5432, "postgresql"),
    (6379, "redis"),
    (27017, "mongodb"),
];

/// Plain TCP connect probe against every known host.
pub struct TcpConnectAdapter {
    ports: Vec<(u16, String)>,
    connect_timeout: Duration,
    parallelism: usize,
}

impl TcpConnectAdapter {
    pub const ID: &'static str = "tcp-connect";

    pub fn new() -> Self {
        Self {
            ports: COMMON_PORTS.iter().map(|(p, n)| (*p, n.to_string())).collect(),
            connect_timeout: Duration::from_millis(1500),
            parallelism: 64,
        }
    }

    pub fn with_ports(mut self, ports: Vec<(u16, String)>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn probe_all(&self, hosts: Vec<String>) -> Vec<RawItem> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism.max(1)));
        let mut probes = JoinSet::new();
        for host in hosts {
            for (port, name) in &self.ports {
                let semaphore = Arc::clone(&semaphore);
                let (host, port, name) = (host.clone(), *port, name.clone());
                let connect_timeout = self.connect_timeout;
                probes.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    let open = matches!(
                        timeout(connect_timeout, TcpStream::connect((host.as_str(), port))).await,
                        Ok(Ok(_))
                    );
                    open.then_some(RawService {
                        host,
                        port,
                        transport: Transport::Tcp,
                        name: Some(name),
                        version: None,
                    })
                });
            }
        }

        let mut open = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(Some(service)) = joined {
                debug!(host = %service.host, port = service.port, "Port open.");
                open.push(RawItem::Service(service));
            }
        }
        open
    }
}

impl Default for TcpConnectAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolAdapter for TcpConnectAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PortScanning]
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        let hosts = ctx.hosts();
        info!(hosts = hosts.len(), ports = self.ports.len(), "Starting TCP connect scan.");
        tokio::select! {
            _ = ctx.cancel.cancelled() => AdapterOutcome::failure(AdapterError::Cancelled),
            open = self.probe_all(hosts) => {
                info!(open = open.len(), "TCP connect scan finished.");
                AdapterOutcome::Success(open)
            }
        }
    }
}
