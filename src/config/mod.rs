//! Application configuration
//!
//! Session tunables, orchestrator timing, where the policy lives, and
//! per-family overrides for apply plans and collectors. Every section has
//! defaults, so an empty file is a valid configuration.

pub mod loader;

pub use loader::{ConfigFormat, ConfigLoader, LoadOptions};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::collector::{Collector, CollectorConfig, CommandCollector, NicCollector};
use crate::error::{Error, Result};
use crate::orchestrator::{ApplyPlan, OrchestratorOptions};
use crate::policy::{ComponentKind, PolicyCatalog, PolicyFile};
use crate::retry::Backoff;
use crate::session::capture::expand_home;
use crate::session::{PingProber, SessionOptions, SshDialer};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
    /// Separate policy file (TOML or JSON)
    pub policy_path: Option<PathBuf>,
    /// Policy tables written inline
    pub policy: Option<PolicyFile>,
    /// Apply plan overrides keyed by family name
    pub plans: BTreeMap<String, ApplyPlan>,
    /// Detection overrides keyed by family name
    pub collectors: BTreeMap<String, CollectorConfig>,
}

/// Connection and transaction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub port: u16,
    pub ssh_program: String,
    /// Passed to the client as `-o` options
    pub ssh_options: Vec<String>,
    pub ping_program: String,
    pub login_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub default_attempts: u32,
    pub auth_attempts: u32,
    pub probe: bool,
    pub probe_count: u32,
    pub probe_attempts: u32,
    pub probe_timeout_secs: u64,
    /// Fixed delay between probe and login attempts; 0 disables it
    pub backoff_ms: u64,
    pub capture_dir: Option<PathBuf>,
    pub line_terminator: String,
    pub original_prompt: String,
    pub strip_ansi: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: 22,
            ssh_program: "ssh".to_string(),
            ssh_options: vec![
                "StrictHostKeyChecking=no".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
            ping_program: "ping".to_string(),
            login_timeout_secs: 10,
            default_timeout_secs: 30,
            default_attempts: 1,
            auth_attempts: 3,
            probe: true,
            probe_count: 4,
            probe_attempts: 3,
            probe_timeout_secs: 10,
            backoff_ms: 500,
            capture_dir: None,
            line_terminator: "\n".to_string(),
            original_prompt: r"[#$]".to_string(),
            strip_ansi: true,
        }
    }
}

impl SessionConfig {
    pub fn to_options(&self) -> SessionOptions {
        let backoff = match self.backoff_ms {
            0 => Backoff::None,
            ms => Backoff::Fixed(Duration::from_millis(ms)),
        };
        SessionOptions {
            login_timeout: Duration::from_secs(self.login_timeout_secs),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            default_attempts: self.default_attempts,
            auth_attempts: self.auth_attempts,
            probe: self.probe,
            probe_count: self.probe_count,
            probe_attempts: self.probe_attempts,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            backoff,
            capture_dir: self.capture_dir.as_deref().map(expand_home),
            line_terminator: self.line_terminator.clone(),
            original_prompt: self.original_prompt.clone(),
            strip_ansi: self.strip_ansi,
            ..SessionOptions::default()
        }
    }

    pub fn dialer(&self) -> SshDialer {
        SshDialer::new(&self.ssh_program, self.ssh_options.clone())
    }

    pub fn prober(&self) -> PingProber {
        PingProber::new(&self.ping_program)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub reboot_settle_secs: u64,
    pub reconnect_settle_secs: u64,
    pub tools_dir: String,
    /// Base for relative image paths; overrides the policy file's own
    pub images_dir: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reboot_settle_secs: 320,
            reconnect_settle_secs: 0,
            tools_dir: "/usr/bin".to_string(),
            images_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn to_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            reboot_settle: Duration::from_secs(self.reboot_settle_secs),
            reconnect_settle: Duration::from_secs(self.reconnect_settle_secs),
            tools_dir: self.tools_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn family_key(key: &str) -> Result<ComponentKind> {
    ComponentKind::from_str(key).map_err(|reason| Error::ConfigValidationFailed {
        field: key.to_string(),
        reason,
    })
}

impl Config {
    /// Apply plan for `kind`: the configured override, else the built-in one
    pub fn plan(&self, kind: ComponentKind) -> ApplyPlan {
        self.plans
            .iter()
            .find(|(key, _)| family_key(key).ok() == Some(kind))
            .map(|(_, plan)| plan.clone())
            .unwrap_or_else(|| ApplyPlan::builtin(kind))
    }

    /// Collector for `kind`: the configured override, else the built-in one.
    /// NIC adapters are limited to the catalog's Intel chipset list when the
    /// policy has one.
    pub fn collector(
        &self,
        kind: ComponentKind,
        catalog: &Arc<PolicyCatalog>,
    ) -> Result<Arc<dyn Collector>> {
        let configured = self
            .collectors
            .iter()
            .find(|(key, _)| family_key(key).ok() == Some(kind))
            .map(|(_, config)| config.clone());
        if let Some(config) = configured {
            return Ok(Arc::new(CommandCollector::from_config(
                &config,
                &self.orchestrator.tools_dir,
            )?));
        }

        if kind == ComponentKind::Nic {
            let mut nic = NicCollector::new();
            if catalog.has_chipset(NicCollector::CHIPSET) {
                nic = nic.within_chipset(catalog.clone(), NicCollector::CHIPSET);
            }
            return Ok(Arc::new(nic));
        }

        let config = CollectorConfig::builtin(kind).ok_or_else(|| {
            Error::config(format!(
                "no collector for family '{}'; add a [collectors.{}] section",
                kind, kind
            ))
        })?;
        Ok(Arc::new(CommandCollector::from_config(
            &config,
            &self.orchestrator.tools_dir,
        )?))
    }

    /// Load the policy catalog. `override_path` wins over the configured
    /// file, which wins over inline tables.
    pub fn load_catalog(&self, override_path: Option<&Path>) -> Result<PolicyCatalog> {
        let images_dir = self.orchestrator.images_dir.as_deref();
        match override_path.or(self.policy_path.as_deref()) {
            Some(path) => PolicyCatalog::load(&expand_home(path), images_dir),
            None => match &self.policy {
                Some(inline) => {
                    let catalog = inline.clone().into_catalog(images_dir);
                    for problem in catalog.validate() {
                        warn!("inline policy: {}", problem);
                    }
                    Ok(catalog)
                }
                None => Err(Error::config(
                    "no policy configured; pass --policy or set policy_path",
                )),
            },
        }
    }

    /// Range and consistency checks
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        let positive = [
            ("session.default_attempts", session.default_attempts as u64),
            ("session.auth_attempts", session.auth_attempts as u64),
            ("session.probe_attempts", session.probe_attempts as u64),
            ("session.probe_count", session.probe_count as u64),
            ("session.login_timeout_secs", session.login_timeout_secs),
            ("session.default_timeout_secs", session.default_timeout_secs),
            ("session.probe_timeout_secs", session.probe_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::ConfigValidationFailed {
                    field: field.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if session.ssh_program.trim().is_empty() {
            return Err(Error::ConfigValidationFailed {
                field: "session.ssh_program".to_string(),
                reason: "client program cannot be empty".to_string(),
            });
        }

        regex::Regex::new(&session.original_prompt).map_err(|e| Error::ConfigValidationFailed {
            field: "session.original_prompt".to_string(),
            reason: e.to_string(),
        })?;

        for (key, plan) in &self.plans {
            family_key(key)?;
            plan.validate().map_err(|e| Error::ConfigValidationFailed {
                field: format!("plans.{}", key),
                reason: e.to_string(),
            })?;
        }

        for (key, config) in &self.collectors {
            family_key(key)?;
            CommandCollector::from_config(config, &self.orchestrator.tools_dir).map_err(|e| {
                Error::ConfigValidationFailed {
                    field: format!("collectors.{}", key),
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(())
    }
}
