// src/core/adapters/command.rs

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::adapter::{AdapterContext, AdapterOutcome, RawFinding, RawItem, RawService, ToolAdapter};
use crate::core::error::AdapterError;
use crate::core::models::{Phase, Transport};

const STDERR_LIMIT: usize = 512;

/// How the stdout of an external tool is read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// One hostname per line.
    Hostnames,
    /// `host:port` or `host:port/proto` per line.
    HostPort,
    /// One JSON finding object per line.
    JsonFindings,
}

/// An external tool declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalToolSpec {
    pub id: String,
    pub phase: Phase,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub output: OutputFormat,
    #[serde(default)]
    pub required: bool,
}

/// Runs an external program and parses its stdout.
///
/// `{target}` in an argument expands to the scan target, `{hosts}` to the
/// comma-separated list of known hosts.
pub struct CommandAdapter {
    spec: ExternalToolSpec,
    phases: [Phase; 1],
}

impl CommandAdapter {
    pub fn new(spec: ExternalToolSpec) -> Self {
        let phases = [spec.phase];
        Self { spec, phases }
    }

    fn args(&self, ctx: &AdapterContext) -> Vec<String> {
        let hosts = ctx.hosts().join(",");
        self.spec
            .args
            .iter()
            .map(|arg| arg.replace("{target}", &ctx.target).replace("{hosts}", &hosts))
            .collect()
    }

    async fn run(&self, args: Vec<String>) -> Result<String, AdapterError> {
        let child = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AdapterError::Launch(format!("{}: {e}", self.spec.program)))?;

        let out = child.wait_with_output().await.map_err(|e| AdapterError::Other(e.to_string()))?;
        if !out.status.success() {
            let mut stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if stderr.len() > STDERR_LIMIT {
                let cut = (0..=STDERR_LIMIT).rev().find(|i| stderr.is_char_boundary(*i)).unwrap_or(0);
                stderr.truncate(cut);
            }
            return Err(AdapterError::NonZeroExit { code: out.status.code(), stderr });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn phases(&self) -> &[Phase] {
        &self.phases
    }

    fn required(&self) -> bool {
        self.spec.required
    }

    async fn execute(&self, ctx: AdapterContext) -> AdapterOutcome {
        let args = self.args(&ctx);
        info!(adapter = %self.spec.id, program = %self.spec.program, ?args, "Launching external tool.");

        // Dropping the run future drops the child, which kills it.
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(AdapterError::Cancelled),
            result = self.run(args) => result,
        };
        match result.and_then(|stdout| parse_output(self.spec.output, &stdout)) {
            Ok(items) => {
                debug!(adapter = %self.spec.id, items = items.len(), "External tool finished.");
                AdapterOutcome::Success(items)
            }
            Err(e) => {
                warn!(adapter = %self.spec.id, error = %e, "External tool failed.");
                AdapterOutcome::failure(e)
            }
        }
    }
}

/// Parses tool stdout. Blank lines and `#` comments are ignored; any other
/// line that does not fit the format fails the whole run.
pub fn parse_output(format: OutputFormat, stdout: &str) -> Result<Vec<RawItem>, AdapterError> {
    stdout
        .lines()
        .map(str::trim)
        .enumerate()
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            parse_line(format, line).ok_or_else(|| AdapterError::MalformedOutput(format!("line {}: {line}", n + 1)))
        })
        .collect()
}

fn parse_line(format: OutputFormat, line: &str) -> Option<RawItem> {
    match format {
        OutputFormat::Hostnames => {
            (!line.contains(char::is_whitespace)).then(|| RawItem::Hostname(line.to_string()))
        }
        OutputFormat::HostPort => {
            let (endpoint, transport) = match line.split_once('/') {
                Some((endpoint, proto)) => (endpoint, proto.parse::<Transport>().ok()?),
                None => (line, Transport::Tcp),
            };
            let (host, port) = endpoint.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            (!host.is_empty()).then(|| {
                RawItem::Service(RawService { host: host.to_string(), port, transport, name: None, version: None })
            })
        }
        OutputFormat::JsonFindings => serde_json::from_str::<RawFinding>(line).ok().map(RawItem::Finding),
    }
}
