// src/config.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::adapters::command::ExternalToolSpec;
use crate::core::error::ConfigError;
use crate::core::executor::ExecutorConfig;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::retry::RetryConfig;
use crate::logging::get_data_dir;

pub const CONFIG_ENV: &str = "VANGUARD_RECON_CONFIG";
const CONFIG_FILE: &str = "config.json";

/// Runtime settings. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub max_in_flight: usize,
    pub adapter_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub phase_deadline_secs: u64,
    /// Attempts per adapter for failures flagged as retryable.
    pub adapter_attempts: u32,
    pub checkpoint_attempts: u32,
    pub checkpoint_backoff_ms: u64,
    /// Where checkpoints (and the default config file) live.
    pub data_dir: PathBuf,
    pub disabled_adapters: Vec<String>,
    pub required_adapters: Vec<String>,
    pub external_tools: Vec<ExternalToolSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            adapter_timeout_secs: 120,
            grace_period_secs: 5,
            phase_deadline_secs: 900,
            adapter_attempts: 1,
            checkpoint_attempts: 4,
            checkpoint_backoff_ms: 200,
            data_dir: get_data_dir(),
            disabled_adapters: Vec::new(),
            required_adapters: Vec::new(),
            external_tools: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from `$VANGUARD_RECON_CONFIG`, or from
    /// `<data_dir>/config.json` when that exists, then applies environment
    /// overrides. `env` is the variable lookup, normally `std::env::var(..).ok()`.
    pub fn load<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = path.map(Path::to_path_buf).or_else(|| env(CONFIG_ENV).map(PathBuf::from));
        let mut settings = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let data_dir = env("VANGUARD_DATA_DIR").map(PathBuf::from).unwrap_or_else(get_data_dir);
                let fallback = data_dir.join(CONFIG_FILE);
                if fallback.is_file() { Self::from_file(&fallback)? } else { Self::default() }
            }
        };

        if let Some(v) = env("VANGUARD_MAX_IN_FLIGHT") {
            settings.max_in_flight = parse_var("max_in_flight", &v)?;
        }
        if let Some(v) = env("VANGUARD_ADAPTER_TIMEOUT_SECS") {
            settings.adapter_timeout_secs = parse_var("adapter_timeout_secs", &v)?;
        }
        if let Some(v) = env("VANGUARD_PHASE_DEADLINE_SECS") {
            settings.phase_deadline_secs = parse_var("phase_deadline_secs", &v)?;
        }
        if let Some(v) = env("VANGUARD_DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }

        settings.validate()?;
        debug!(?settings, "Settings loaded.");
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: display.clone(), source })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path: display, source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_in_flight", self.max_in_flight as u64),
            ("adapter_timeout_secs", self.adapter_timeout_secs),
            ("phase_deadline_secs", self.phase_deadline_secs),
            ("adapter_attempts", u64::from(self.adapter_attempts)),
            ("checkpoint_attempts", u64::from(self.checkpoint_attempts)),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid { field: *field, reason: "must be greater than zero".into() });
        }
        if let Some(tool) = self.external_tools.iter().find(|t| t.id.trim().is_empty() || t.program.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "external_tools",
                reason: format!("tool {:?} needs both an id and a program", tool.id),
            });
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            executor: ExecutorConfig {
                max_in_flight: self.max_in_flight,
                adapter_timeout: Duration::from_secs(self.adapter_timeout_secs),
                grace_period: Duration::from_secs(self.grace_period_secs),
                phase_deadline: Duration::from_secs(self.phase_deadline_secs),
                retry: RetryConfig::default().with_max_attempts(self.adapter_attempts),
            },
            checkpoint_retry: RetryConfig::default()
                .with_max_attempts(self.checkpoint_attempts)
                .with_initial_backoff(Duration::from_millis(self.checkpoint_backoff_ms)),
        }
    }

    /// Directory the file checkpoint store writes to.
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }
}

fn parse_var<T: FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid { field, reason: format!("cannot parse {raw:?}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::adapters::command::OutputFormat;
    use crate::core::models::Phase;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.json");
        fs::write(
            &path,
            r#"{
                "max_in_flight": 8,
                "disabled_adapters": ["crtsh"],
                "external_tools": [
                    {"id": "subfinder", "phase": "discovery", "program": "subfinder",
                     "args": ["-d", "{target}"], "output": "hostnames", "required": true}
                ]
            }"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path), env_of(&[])).unwrap();
        assert_eq!(settings.max_in_flight, 8);
        assert_eq!(settings.adapter_timeout_secs, 120);
        assert_eq!(settings.disabled_adapters, vec!["crtsh"]);
        assert_eq!(settings.external_tools[0].phase, Phase::Discovery);
        assert_eq!(settings.external_tools[0].output, OutputFormat::Hostnames);
        assert!(settings.external_tools[0].required);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.json");
        fs::write(&path, r#"{"max_in_flight": 8}"#).unwrap();
        let env = env_of(&[
            (CONFIG_ENV, path.to_str().unwrap()),
            ("VANGUARD_MAX_IN_FLIGHT", "2"),
            ("VANGUARD_PHASE_DEADLINE_SECS", "60"),
            ("VANGUARD_DATA_DIR", "/tmp/vanguard-recon-test"),
        ]);

        let settings = Settings::load(None, env).unwrap();
        assert_eq!(settings.max_in_flight, 2);
        assert_eq!(settings.phase_deadline_secs, 60);
        assert_eq!(settings.jobs_dir(), PathBuf::from("/tmp/vanguard-recon-test/jobs"));
    }

    #[test]
    fn data_dir_config_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"adapter_attempts": 3}"#).unwrap();
        let env = env_of(&[("VANGUARD_DATA_DIR", dir.path().to_str().unwrap())]);
        assert_eq!(Settings::load(None, env).unwrap().adapter_attempts, 3);
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let env = env_of(&[("VANGUARD_MAX_IN_FLIGHT", "0"), ("VANGUARD_DATA_DIR", "/nonexistent/vanguard-recon")]);
        assert!(matches!(
            Settings::load(None, env),
            Err(ConfigError::Invalid { field: "max_in_flight", .. })
        ));

        let env = env_of(&[("VANGUARD_ADAPTER_TIMEOUT_SECS", "soon"), ("VANGUARD_DATA_DIR", "/nonexistent/vanguard-recon")]);
        assert!(matches!(Settings::load(None, env), Err(ConfigError::Invalid { field: "adapter_timeout_secs", .. })));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ max_in_flight: ").unwrap();
        assert!(matches!(Settings::load(Some(&path), env_of(&[])), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Settings::load(Some(&dir.path().join("missing.json")), env_of(&[])),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn maps_to_orchestrator_config() {
        let settings = Settings { adapter_timeout_secs: 30, checkpoint_attempts: 2, ..Settings::default() };
        let config = settings.orchestrator_config();
        assert_eq!(config.executor.adapter_timeout, Duration::from_secs(30));
        assert_eq!(config.executor.retry.max_attempts, 1);
        assert_eq!(config.checkpoint_retry.max_attempts, 2);
        assert_eq!(config.checkpoint_retry.initial_backoff, Duration::from_millis(200));
    }
}
