//! Decision Engine
//!
//! Pure functions that turn a detected (identity, version) into an update
//! decision against a [`PolicyRegistry`]. Nothing here touches a session,
//! so the outcome of a run is fully determined before any command is sent.
//!
//! Auto mode checks, in order: already preferred, tolerated, blocked by a
//! conflict rule, otherwise update to the preferred version. Forced mode
//! pins an explicit target for a named platform model and slot.

use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};
use crate::policy::{ArtifactLocation, ComponentIdentity, ModelMap, PolicyRegistry, Version};

/// What the engine concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DecisionOutcome {
    /// Installed version is the preferred one
    NoUpdateMatched,
    /// Installed version is tolerated
    NoUpdateAcceptable,
    /// Moving from the installed version to the preferred one is forbidden
    ConflictBlocked,
    UpdateRequired,
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DecisionOutcome::NoUpdateMatched => "up to date",
            DecisionOutcome::NoUpdateAcceptable => "acceptable",
            DecisionOutcome::ConflictBlocked => "blocked by conflict",
            DecisionOutcome::UpdateRequired => "update required",
        };
        f.write_str(text)
    }
}

/// Full decision for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateDecision {
    pub outcome: DecisionOutcome,
    pub identity: ComponentIdentity,
    pub current: Version,
    pub target: Version,
    /// Image for the target version; informational unless an update is
    /// required, absent when blocked
    pub artifact: Option<ArtifactLocation>,
    /// Target was pinned by the operator
    pub forced: bool,
}

impl UpdateDecision {
    pub fn requires_update(&self) -> bool {
        self.outcome == DecisionOutcome::UpdateRequired
    }

    /// `Ok(Some)` when an update must be applied, `Ok(None)` when nothing
    /// needs doing, and [`Error::ConflictBlocked`] for a blocked path
    pub fn into_required(self) -> Result<Option<UpdateDecision>> {
        match self.outcome {
            DecisionOutcome::UpdateRequired => Ok(Some(self)),
            DecisionOutcome::NoUpdateMatched | DecisionOutcome::NoUpdateAcceptable => Ok(None),
            DecisionOutcome::ConflictBlocked => Err(Error::ConflictBlocked {
                identity: self.identity.to_string(),
                current: self.current.to_string(),
                target: self.target.to_string(),
            }),
        }
    }

    /// Artifact for an update decision
    pub fn required_artifact(&self) -> Result<&ArtifactLocation> {
        match (&self.outcome, &self.artifact) {
            (DecisionOutcome::UpdateRequired, Some(artifact)) => Ok(artifact),
            _ => Err(Error::config(format!(
                "{} at {} does not call for an update ({})",
                self.identity, self.current, self.outcome
            ))),
        }
    }
}

/// Auto-mode decision for a detected component
pub fn decide(
    registry: &PolicyRegistry,
    identity: &ComponentIdentity,
    current: &Version,
) -> Result<UpdateDecision> {
    let preferred = registry.preferred(identity).ok_or_else(|| {
        Error::config(format!("no preferred version for component '{}'", identity))
    })?;
    // Resolve the artifact first so a broken table is reported even for
    // components that happen to be up to date
    let artifact = registry.artifact(identity, preferred).ok_or_else(|| {
        Error::config(format!(
            "no artifact for component '{}' version {}",
            identity, preferred
        ))
    })?;

    let outcome = if current == preferred {
        DecisionOutcome::NoUpdateMatched
    } else if registry.is_acceptable(identity, current) {
        DecisionOutcome::NoUpdateAcceptable
    } else if registry.is_conflicting(identity, preferred, current) {
        DecisionOutcome::ConflictBlocked
    } else {
        DecisionOutcome::UpdateRequired
    };

    debug!("{} {} -> {}: {}", identity, current, preferred, outcome);

    Ok(UpdateDecision {
        outcome,
        identity: identity.clone(),
        current: current.clone(),
        target: preferred.clone(),
        artifact: (outcome != DecisionOutcome::ConflictBlocked).then(|| artifact.clone()),
        forced: false,
    })
}

/// Operator-pinned target, resolved before any session is used
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForcedTarget {
    pub model: String,
    pub slot: String,
    /// Part the model map says should be installed
    pub expected: ComponentIdentity,
    pub version: Version,
    pub artifact: ArtifactLocation,
}

impl ForcedTarget {
    /// Compare against what is actually installed
    pub fn verify(&self, detected: &ComponentIdentity, current: &Version) -> Result<UpdateDecision> {
        if detected != &self.expected {
            return Err(Error::Mismatch {
                model: self.model.clone(),
                expected: self.expected.to_string(),
                detected: detected.to_string(),
            });
        }
        Ok(UpdateDecision {
            outcome: DecisionOutcome::UpdateRequired,
            identity: self.expected.clone(),
            current: current.clone(),
            target: self.version.clone(),
            artifact: Some(self.artifact.clone()),
            forced: true,
        })
    }
}

/// Resolve the expected part for `model`/`slot` and the image for `version`
pub fn plan_forced(
    registry: &PolicyRegistry,
    models: &ModelMap,
    model: &str,
    slot: &str,
    version: &Version,
) -> Result<ForcedTarget> {
    let expected = models.expected(model, slot)?;
    let artifact = registry.artifact(expected, version).ok_or_else(|| {
        Error::config(format!(
            "no artifact for component '{}' version {}",
            expected, version
        ))
    })?;
    Ok(ForcedTarget {
        model: model.to_string(),
        slot: slot.to_string(),
        expected: expected.clone(),
        version: version.clone(),
        artifact: artifact.clone(),
    })
}

/// [`plan_forced`] followed by [`ForcedTarget::verify`]
pub fn decide_forced(
    registry: &PolicyRegistry,
    models: &ModelMap,
    model: &str,
    slot: &str,
    version: &Version,
    detected: &ComponentIdentity,
    current: &Version,
) -> Result<UpdateDecision> {
    plan_forced(registry, models, model, slot, version)?.verify(detected, current)
}
