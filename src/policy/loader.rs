//! Policy file loading
//!
//! One file describes every family. Each family section is a list of
//! parts; relative image paths are resolved against `images_dir`.
//!
//! ```toml
//! images_dir = "/usr/imgs"
//!
//! [models."NX-3060-G6"]
//! BMC = "X11DPT-B"
//!
//! [[bmc]]
//! part = "X11DPT-B"
//! preferred = "6.39"
//! acceptable = ["6.39"]
//! artifacts = { "6.39" = "bmc/X11DPT-B/NX-G6-639-180122.bin" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use super::{ComponentIdentity, ComponentKind, ModelMap, PolicyRegistry};
use crate::config::ConfigFormat;
use crate::error::{Error, Result};

/// Tables for one part
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentPolicy {
    pub part: String,
    #[serde(default)]
    pub preferred: Option<String>,
    #[serde(default)]
    pub acceptable: Vec<String>,
    /// Version to image path
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    /// Target version to the versions it must not be flashed over
    #[serde(default)]
    pub conflicts: BTreeMap<String, Vec<String>>,
}

/// On-disk policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub images_dir: Option<String>,
    #[serde(default)]
    pub models: ModelMap,
    /// Chipset vendor to the PCI identities it covers
    #[serde(default)]
    pub chipsets: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub bmc: Vec<ComponentPolicy>,
    #[serde(default)]
    pub bios: Vec<ComponentPolicy>,
    #[serde(default)]
    pub hba: Vec<ComponentPolicy>,
    #[serde(default)]
    pub mcu: Vec<ComponentPolicy>,
    #[serde(default)]
    pub mlx: Vec<ComponentPolicy>,
    #[serde(default)]
    pub nic: Vec<ComponentPolicy>,
}

impl PolicyFile {
    fn family(&self, kind: ComponentKind) -> &[ComponentPolicy] {
        match kind {
            ComponentKind::Bmc => &self.bmc,
            ComponentKind::Bios => &self.bios,
            ComponentKind::Hba => &self.hba,
            ComponentKind::Mcu => &self.mcu,
            ComponentKind::Mlx => &self.mlx,
            ComponentKind::Nic => &self.nic,
        }
    }

    /// Build the immutable catalog. `images_dir` overrides the file's own.
    pub fn into_catalog(self, images_dir: Option<&str>) -> PolicyCatalog {
        let images_dir = images_dir
            .map(str::to_string)
            .or_else(|| self.images_dir.clone());

        let mut families = HashMap::new();
        for kind in ComponentKind::ALL {
            let entries = self.family(kind);
            if entries.is_empty() {
                continue;
            }
            let registry = build_registry(entries, images_dir.as_deref());
            families.insert(kind, Arc::new(registry));
        }

        let chipsets = self
            .chipsets
            .into_iter()
            .map(|(vendor, ids)| (vendor, ids.into_iter().map(ComponentIdentity::from).collect()))
            .collect();

        PolicyCatalog {
            families,
            models: self.models,
            chipsets,
            images_dir,
        }
    }
}

fn resolve(location: &str, images_dir: Option<&str>) -> String {
    match images_dir {
        Some(dir) if !location.starts_with('/') => {
            format!("{}/{}", dir.trim_end_matches('/'), location)
        }
        _ => location.to_string(),
    }
}

fn build_registry(entries: &[ComponentPolicy], images_dir: Option<&str>) -> PolicyRegistry {
    let mut builder = PolicyRegistry::builder();
    for entry in entries {
        let part = entry.part.as_str();
        for (version, location) in &entry.artifacts {
            builder = builder.artifact(part, version.as_str(), resolve(location, images_dir));
        }
        if let Some(preferred) = &entry.preferred {
            builder = builder.preferred(part, preferred.as_str());
        }
        if !entry.acceptable.is_empty() {
            builder = builder.acceptable(part, entry.acceptable.iter().map(String::as_str));
        }
        for (target, blocked) in &entry.conflicts {
            builder = builder.conflict(part, target.as_str(), blocked.iter().map(String::as_str));
        }
    }
    builder.build()
}

/// Registries for every family plus the platform model map
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    families: HashMap<ComponentKind, Arc<PolicyRegistry>>,
    models: ModelMap,
    chipsets: BTreeMap<String, Vec<ComponentIdentity>>,
    images_dir: Option<String>,
}

impl PolicyCatalog {
    /// Load a TOML or JSON policy file, chosen by extension
    pub fn load(path: &Path, images_dir: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: PolicyFile = ConfigFormat::from_path(path).parse(&content)?;
        let catalog = file.into_catalog(images_dir);
        for problem in catalog.validate() {
            warn!("{}: {}", path.display(), problem);
        }
        info!(
            "Loaded policy from {} ({} families, {} models)",
            path.display(),
            catalog.families.len(),
            catalog.models.len()
        );
        Ok(catalog)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PolicyFile = ConfigFormat::Toml.parse(content)?;
        Ok(file.into_catalog(None))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let file: PolicyFile = ConfigFormat::Json.parse(content)?;
        Ok(file.into_catalog(None))
    }

    /// Catalog with a single family, mostly for tests
    pub fn single(kind: ComponentKind, registry: PolicyRegistry, models: ModelMap) -> Self {
        let mut families = HashMap::new();
        families.insert(kind, Arc::new(registry));
        Self {
            families,
            models,
            chipsets: BTreeMap::new(),
            images_dir: None,
        }
    }

    pub fn registry(&self, kind: ComponentKind) -> Result<Arc<PolicyRegistry>> {
        self.families
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::config(format!("no policy tables for family '{}'", kind)))
    }

    pub fn models(&self) -> &ModelMap {
        &self.models
    }

    pub fn images_dir(&self) -> Option<&str> {
        self.images_dir.as_deref()
    }

    /// Chipset vendor whose identity list contains `identity`
    pub fn chipset_of(&self, identity: &ComponentIdentity) -> Option<&str> {
        self.chipsets
            .iter()
            .find(|(_, ids)| ids.contains(identity))
            .map(|(vendor, _)| vendor.as_str())
    }

    pub fn has_chipset(&self, vendor: &str) -> bool {
        self.chipsets.contains_key(vendor)
    }

    /// Problems across all families, prefixed with the family name
    pub fn validate(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.families.keys().copied().collect();
        kinds.sort();
        let mut problems = Vec::new();
        for kind in kinds {
            if let Some(registry) = self.families.get(&kind) {
                problems.extend(
                    registry
                        .validate()
                        .into_iter()
                        .map(|p| format!("[{}] {}", kind, p)),
                );
            }
        }
        problems
    }
}
