//! Policy Registry
//!
//! Static compatibility tables for one hardware family: which image file
//! belongs to each (part, version), the preferred version per part, the
//! versions that are tolerated, and the upgrade paths that are known to
//! brick a part. The registry is built once at load time and shared
//! read-only (behind an `Arc`) by every concurrent host run.

pub mod loader;

pub use loader::{ComponentPolicy, PolicyCatalog, PolicyFile};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_newtype!(
    /// Part number or model string of a component, e.g. `X11DPT-B`
    ComponentIdentity
);
string_newtype!(
    /// Opaque firmware version, compared by exact equality
    Version
);
string_newtype!(
    /// Path of a firmware image on the remote host
    ArtifactLocation
);

impl ArtifactLocation {
    /// Directory part of the path, without trailing slash
    pub fn dir(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some(("", _)) => "/",
            Some((dir, _)) => dir,
            None => ".",
        }
    }

    /// File name part of the path
    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map(|(_, name)| name).unwrap_or(&self.0)
    }

    /// Whether the path is absolute on the remote host
    pub fn is_absolute(&self) -> bool {
        self.0.starts_with('/')
    }
}

/// Hardware families with an update procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Bmc,
    Bios,
    Hba,
    Mcu,
    Mlx,
    Nic,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 6] = [
        ComponentKind::Bmc,
        ComponentKind::Bios,
        ComponentKind::Hba,
        ComponentKind::Mcu,
        ComponentKind::Mlx,
        ComponentKind::Nic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Bmc => "bmc",
            ComponentKind::Bios => "bios",
            ComponentKind::Hba => "hba",
            ComponentKind::Mcu => "mcu",
            ComponentKind::Mlx => "mlx",
            ComponentKind::Nic => "nic",
        }
    }

    /// Slot name used in the model map; add-in cards have none and are
    /// named explicitly by the operator
    pub fn model_slot(&self) -> Option<&'static str> {
        match self {
            ComponentKind::Bmc => Some("BMC"),
            ComponentKind::Bios => Some("BIOS"),
            ComponentKind::Hba => Some("HBA"),
            ComponentKind::Mcu => Some("MCU"),
            ComponentKind::Mlx | ComponentKind::Nic => None,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ComponentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown component family '{}' (expected one of bmc, bios, hba, mcu, mlx, nic)",
                    s
                )
            })
    }
}

/// Compatibility tables for one family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRegistry {
    artifacts: HashMap<ComponentIdentity, HashMap<Version, ArtifactLocation>>,
    preferred: HashMap<ComponentIdentity, Version>,
    acceptable: HashMap<ComponentIdentity, HashSet<Version>>,
    conflicts: HashMap<ComponentIdentity, HashMap<Version, HashSet<Version>>>,
}

impl PolicyRegistry {
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    pub fn preferred(&self, identity: &ComponentIdentity) -> Option<&Version> {
        self.preferred.get(identity)
    }

    pub fn artifact(
        &self,
        identity: &ComponentIdentity,
        version: &Version,
    ) -> Option<&ArtifactLocation> {
        self.artifacts.get(identity)?.get(version)
    }

    /// Versions with an image on file for `identity`
    pub fn versions(&self, identity: &ComponentIdentity) -> Vec<&Version> {
        let mut versions: Vec<_> = self
            .artifacts
            .get(identity)
            .map(|by_version| by_version.keys().collect())
            .unwrap_or_default();
        versions.sort();
        versions
    }

    pub fn is_acceptable(&self, identity: &ComponentIdentity, version: &Version) -> bool {
        self.acceptable
            .get(identity)
            .is_some_and(|versions| versions.contains(version))
    }

    /// Whether moving `identity` from `current` to `target` is blocked
    pub fn is_conflicting(
        &self,
        identity: &ComponentIdentity,
        target: &Version,
        current: &Version,
    ) -> bool {
        self.conflicts
            .get(identity)
            .and_then(|by_target| by_target.get(target))
            .is_some_and(|blocked| blocked.contains(current))
    }

    /// Every identity named anywhere in the tables
    pub fn identities(&self) -> Vec<&ComponentIdentity> {
        let mut ids: Vec<_> = self
            .artifacts
            .keys()
            .chain(self.preferred.keys())
            .chain(self.acceptable.keys())
            .chain(self.conflicts.keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.preferred.is_empty()
    }

    /// Consistency problems that would surface as configuration errors at
    /// decision time. Empty when the tables are coherent.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (identity, version) in &self.preferred {
            if self.artifact(identity, version).is_none() {
                problems.push(format!(
                    "{}: preferred version {} has no artifact",
                    identity, version
                ));
            }
        }
        for (identity, by_target) in &self.conflicts {
            for target in by_target.keys() {
                if self.artifact(identity, target).is_none() {
                    problems.push(format!(
                        "{}: conflict rule for {} names a version without an artifact",
                        identity, target
                    ));
                }
            }
        }
        for identity in self.acceptable.keys() {
            if !self.preferred.contains_key(identity) {
                problems.push(format!(
                    "{}: acceptable versions listed but no preferred version",
                    identity
                ));
            }
        }
        problems.sort();
        problems
    }
}

/// Incremental construction of a [`PolicyRegistry`]
#[derive(Debug, Default)]
pub struct PolicyRegistryBuilder {
    registry: PolicyRegistry,
}

impl PolicyRegistryBuilder {
    pub fn artifact(
        mut self,
        identity: impl Into<ComponentIdentity>,
        version: impl Into<Version>,
        location: impl Into<ArtifactLocation>,
    ) -> Self {
        self.registry
            .artifacts
            .entry(identity.into())
            .or_default()
            .insert(version.into(), location.into());
        self
    }

    pub fn preferred(
        mut self,
        identity: impl Into<ComponentIdentity>,
        version: impl Into<Version>,
    ) -> Self {
        self.registry
            .preferred
            .insert(identity.into(), version.into());
        self
    }

    pub fn acceptable<I, V>(mut self, identity: impl Into<ComponentIdentity>, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Version>,
    {
        self.registry
            .acceptable
            .entry(identity.into())
            .or_default()
            .extend(versions.into_iter().map(Into::into));
        self
    }

    /// Moving to `target` from any of `blocked` is forbidden
    pub fn conflict<I, V>(
        mut self,
        identity: impl Into<ComponentIdentity>,
        target: impl Into<Version>,
        blocked: I,
    ) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Version>,
    {
        self.registry
            .conflicts
            .entry(identity.into())
            .or_default()
            .entry(target.into())
            .or_default()
            .extend(blocked.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> PolicyRegistry {
        self.registry
    }
}

/// Expected part per slot for each platform model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelMap(BTreeMap<String, BTreeMap<String, ComponentIdentity>>);

impl ModelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        model: impl Into<String>,
        slot: impl Into<String>,
        identity: impl Into<ComponentIdentity>,
    ) {
        self.0
            .entry(model.into())
            .or_default()
            .insert(slot.into(), identity.into());
    }

    /// Part expected in `slot` of `model`
    pub fn expected(&self, model: &str, slot: &str) -> Result<&ComponentIdentity> {
        let slots = self
            .0
            .get(model)
            .ok_or_else(|| Error::config(format!("unknown platform model '{}'", model)))?;
        slots.get(slot).ok_or_else(|| {
            Error::config(format!("model '{}' has no '{}' slot", model, slot))
        })
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
