//! Component detection
//!
//! A [`Collector`] reads the installed part identity and firmware version off
//! a live session. Vendor-tool parsing lives here and nowhere else: the
//! decision engine only ever sees the extracted strings.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{ComponentIdentity, ComponentKind, PolicyCatalog, Version};
use crate::session::Session;
use crate::transaction::Transaction;

// First function of every onboard or add-in Ethernet adapter
static ADAPTER_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\benp\w*?f0\b").expect("valid regex"));
static NIC_FIRMWARE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*firmware-version:\s*(?P<value>0x[0-9a-f]+)").expect("valid regex")
});
static NIC_BUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*bus-info:\s*(?P<value>[0-9a-f]+:[0-9a-f:.]+)").expect("valid regex")
});
static PCI_SUBSYSTEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Subsystem:\s*(?P<value>[0-9a-f]{4}:[0-9a-f]{4})").expect("valid regex")
});

/// What is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detected {
    pub identity: ComponentIdentity,
    pub version: Version,
}

impl Detected {
    pub fn new(identity: impl Into<ComponentIdentity>, version: impl Into<Version>) -> Self {
        Self {
            identity: identity.into(),
            version: version.into(),
        }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn detect(&self, session: &mut Session) -> Result<Detected>;

    /// Every matching component on the host, in discovery order. Families
    /// with one component per host report just that one.
    async fn detect_all(&self, session: &mut Session) -> Result<Vec<Detected>> {
        Ok(vec![self.detect(session).await?])
    }
}

/// Run `command` and return its output, minus the echo and prompt
async fn query(session: &mut Session, command: &str, timeout: Duration) -> Result<String> {
    let tx = Transaction::new(command).expect_prompt().timeout(timeout);
    match session.execute(&tx).await {
        Ok(result) => Ok(result.body()),
        Err(Error::Timeout { command, .. }) => Err(Error::Detection {
            reason: format!("'{}' did not return to the prompt", command),
        }),
        Err(e) => Err(e),
    }
}

fn default_collect_timeout() -> u64 {
    30
}

/// Command/regex pairs for [`CommandCollector`].
///
/// Patterns may name a `value` group; otherwise the first group, or the
/// whole match, is taken. `{tools_dir}` in commands is substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub identity_command: String,
    pub identity_pattern: String,
    pub version_command: String,
    pub version_pattern: String,
    #[serde(default = "default_collect_timeout")]
    pub timeout_secs: u64,
}

impl CollectorConfig {
    pub fn new(
        identity_command: impl Into<String>,
        identity_pattern: impl Into<String>,
        version_command: impl Into<String>,
        version_pattern: impl Into<String>,
    ) -> Self {
        Self {
            identity_command: identity_command.into(),
            identity_pattern: identity_pattern.into(),
            version_command: version_command.into(),
            version_pattern: version_pattern.into(),
            timeout_secs: default_collect_timeout(),
        }
    }

    /// Stock detection for a family. NIC adapters are enumerated port by
    /// port, which a single command cannot do; see [`NicCollector`].
    pub fn builtin(kind: ComponentKind) -> Option<Self> {
        let config = match kind {
            ComponentKind::Bmc => Self::new(
                "dmidecode -t baseboard",
                r"(?im)^\s*Product Name:\s*(?P<value>\S+)",
                "{tools_dir}/ipmicfg-linux.x86_64 -ver",
                r"(?i)Firmware Revision\s*:\s*(?P<value>\d+[.\-]\d+)",
            ),
            ComponentKind::Bios => Self::new(
                "dmidecode -t baseboard",
                r"(?im)^\s*Product Name:\s*(?P<value>\S+)",
                "dmidecode -t bios",
                r"(?im)^\s*Version:\s*(?P<value>\S+)",
            ),
            ComponentKind::Hba => Self::new(
                "{tools_dir}/sas3flash -listall",
                r"(?m)^\s*\d+\s+(?P<value>SAS\d{4})",
                "{tools_dir}/sas3flash -listall",
                r"SAS\d{4}\W\w\d\W\s+(?P<value>\d+\.\d+\.\d+\.\d+)",
            ),
            ComponentKind::Mcu => Self::new(
                "{tools_dir}/ipmicfg-linux.x86_64 -tp info",
                r"(?P<value>BPN\S+)",
                "{tools_dir}/ipmicfg-linux.x86_64 -tp info",
                r"MCU\s+.*?(?P<value>\d+\.\d+)",
            ),
            ComponentKind::Mlx => Self::new(
                "{tools_dir}/mlxup -query",
                r"(?im)(?P<value>MCX\S+)",
                "{tools_dir}/mlxup -query",
                r"(?im)FW\s+(?P<value>\d+\.\d+\.\d+)",
            ),
            ComponentKind::Nic => return None,
        };
        Some(config)
    }
}

/// Runs one command per field and extracts it with a regex
#[derive(Debug, Clone)]
pub struct CommandCollector {
    identity_command: String,
    identity_pattern: Regex,
    version_command: String,
    version_pattern: Regex,
    timeout: Duration,
}

impl CommandCollector {
    pub fn from_config(config: &CollectorConfig, tools_dir: &str) -> Result<Self> {
        let render = |cmd: &str| cmd.replace("{tools_dir}", tools_dir.trim_end_matches('/'));
        Ok(Self {
            identity_command: render(&config.identity_command),
            identity_pattern: Regex::new(&config.identity_pattern)?,
            version_command: render(&config.version_command),
            version_pattern: Regex::new(&config.version_pattern)?,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

/// Value of `pattern` in `text`: the `value` group, else group 1, else the
/// whole match
pub fn extract(pattern: &Regex, text: &str) -> Option<String> {
    let caps = pattern.captures(text)?;
    let m = caps
        .name("value")
        .or_else(|| caps.get(1))
        .or_else(|| caps.get(0))?;
    let value = m.as_str().trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[async_trait]
impl Collector for CommandCollector {
    async fn detect(&self, session: &mut Session) -> Result<Detected> {
        let identity_output = query(session, &self.identity_command, self.timeout).await?;
        let identity = extract(&self.identity_pattern, &identity_output).ok_or_else(|| {
            Error::Detection {
                reason: format!(
                    "no part identity in output of '{}'",
                    self.identity_command
                ),
            }
        })?;

        let version_output = if self.version_command == self.identity_command {
            identity_output
        } else {
            query(session, &self.version_command, self.timeout).await?
        };
        let version = extract(&self.version_pattern, &version_output).ok_or_else(|| {
            Error::Detection {
                reason: format!("no version in output of '{}'", self.version_command),
            }
        })?;

        debug!("{}: detected {} at {}", session.host(), identity, version);
        Ok(Detected::new(identity, version))
    }
}

/// Network adapters, one [`Detected`] per adapter.
///
/// Ports are listed with `ip`, and only the first function (`...f0`) of
/// each adapter is read. `ethtool -i` gives the NVM version and bus address;
/// `lspci` turns the bus address into the PCI subsystem id that keys the
/// policy tables. Adapters the update tool cannot handle are skipped: by
/// chipset membership when a catalog is attached, else by subsystem vendor.
#[derive(Debug, Clone)]
pub struct NicCollector {
    vendors: Vec<String>,
    chipset: Option<(Arc<PolicyCatalog>, String)>,
    timeout: Duration,
}

impl Default for NicCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NicCollector {
    /// Chipset family handled by the NVM update tool
    pub const CHIPSET: &'static str = "INTC";

    pub fn new() -> Self {
        Self {
            vendors: vec!["15d9".to_string()],
            chipset: None,
            timeout: Duration::from_secs(default_collect_timeout()),
        }
    }

    /// Subsystem vendor ids to keep when no chipset is attached
    pub fn vendors<I, S>(mut self, vendors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vendors = vendors.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only adapters the catalog lists under `chipset`
    pub fn within_chipset(mut self, catalog: Arc<PolicyCatalog>, chipset: impl Into<String>) -> Self {
        self.chipset = Some((catalog, chipset.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_eligible(&self, identity: &ComponentIdentity) -> bool {
        match &self.chipset {
            Some((catalog, chipset)) => catalog.chipset_of(identity) == Some(chipset.as_str()),
            None => {
                let vendor = identity.as_str().split(':').next().unwrap_or_default();
                self.vendors.iter().any(|v| v.eq_ignore_ascii_case(vendor))
            }
        }
    }

    /// The adapter behind `port`, or `None` when it is not ours to update
    async fn adapter(&self, session: &mut Session, port: &str) -> Result<Option<Detected>> {
        let info = query(session, &format!("ethtool -i {}", port), self.timeout).await?;
        let missing = |what: &str| Error::Detection {
            reason: format!("no {} for {} in ethtool output", what, port),
        };
        let bus = extract(&NIC_BUS, &info).ok_or_else(|| missing("bus address"))?;

        let pci = query(session, &format!("lspci -s {} -vn", bus), self.timeout).await?;
        let identity = ComponentIdentity::from(
            extract(&PCI_SUBSYSTEM, &pci)
                .ok_or_else(|| Error::Detection {
                    reason: format!("no PCI subsystem for {} at {}", port, bus),
                })?
                .to_ascii_lowercase(),
        );
        if !self.is_eligible(&identity) {
            info!(
                "{}: skipping {} ({} is not handled by the update tool)",
                session.host(),
                port,
                identity
            );
            return Ok(None);
        }

        let version = extract(&NIC_FIRMWARE, &info).ok_or_else(|| missing("firmware version"))?;
        debug!("{}: {} is {} at {}", session.host(), port, identity, version);
        Ok(Some(Detected::new(identity, version.to_ascii_lowercase())))
    }
}

#[async_trait]
impl Collector for NicCollector {
    async fn detect(&self, session: &mut Session) -> Result<Detected> {
        self.detect_all(session)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Detection {
                reason: "no supported network adapter".to_string(),
            })
    }

    async fn detect_all(&self, session: &mut Session) -> Result<Vec<Detected>> {
        let listing = query(session, "ip -o link show", self.timeout).await?;
        let mut ports: Vec<String> = Vec::new();
        for port in ADAPTER_PORT.find_iter(&listing) {
            if !ports.iter().any(|p| p == port.as_str()) {
                ports.push(port.as_str().to_string());
            }
        }
        debug!("{}: adapter ports {:?}", session.host(), ports);

        let mut adapters = Vec::new();
        for port in &ports {
            if let Some(adapter) = self.adapter(session, port).await? {
                adapters.push(adapter);
            }
        }

        if adapters.is_empty() {
            return Err(Error::Detection {
                reason: format!("no supported adapter among {} port(s)", ports.len()),
            });
        }
        Ok(adapters)
    }
}

/// Collector with a fixed answer
#[derive(Debug, Clone)]
pub struct StaticCollector {
    detected: Detected,
}

impl StaticCollector {
    pub fn new(identity: impl Into<ComponentIdentity>, version: impl Into<Version>) -> Self {
        Self {
            detected: Detected::new(identity, version),
        }
    }
}

#[async_trait]
impl Collector for StaticCollector {
    async fn detect(&self, _session: &mut Session) -> Result<Detected> {
        Ok(self.detected.clone())
    }
}
