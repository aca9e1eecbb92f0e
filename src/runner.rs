//! One update run against one host
//!
//! Ties the pieces together in a fixed order: resolve a forced target (no
//! session needed), connect, detect, decide, apply. A host can carry more
//! than one component of a family (NIC adapters); `run_all` walks them in
//! detection order over one session. The session is always disconnected,
//! whatever the outcome.

use serde::Serialize;
use std::sync::Arc;

use crate::collector::{Collector, Detected};
use crate::decision::{decide, plan_forced, ForcedTarget, UpdateDecision};
use crate::error::Result;
use crate::orchestrator::{ApplyPlan, ApplyReport, OrchestratorOptions, UpdateOrchestrator};
use crate::policy::{ComponentKind, PolicyCatalog, PolicyRegistry, Version};
use crate::session::{Session, SessionFactory};

/// How the target version is chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateMode {
    /// Follow the policy tables
    Auto,
    /// Pin `version` for the part expected in `slot` of platform `model`
    Forced {
        model: String,
        slot: String,
        version: Version,
    },
}

/// What a run ended with
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    /// Installed firmware is preferred or acceptable
    NoUpdate(UpdateDecision),
    /// Dry run: an update would have been applied
    Planned(UpdateDecision),
    Applied {
        decision: UpdateDecision,
        report: ApplyReport,
    },
}

impl JobOutcome {
    pub fn decision(&self) -> &UpdateDecision {
        match self {
            JobOutcome::NoUpdate(decision) | JobOutcome::Planned(decision) => decision,
            JobOutcome::Applied { decision, .. } => decision,
        }
    }
}

/// Everything needed to update one family on a host
#[derive(Clone)]
pub struct UpdateJob {
    kind: ComponentKind,
    catalog: Arc<PolicyCatalog>,
    collector: Arc<dyn Collector>,
    plan: ApplyPlan,
    orchestrator: OrchestratorOptions,
    mode: UpdateMode,
    controller: u32,
    dry_run: bool,
}

impl UpdateJob {
    pub fn new(
        kind: ComponentKind,
        catalog: Arc<PolicyCatalog>,
        collector: Arc<dyn Collector>,
        plan: ApplyPlan,
    ) -> Self {
        Self {
            kind,
            catalog,
            collector,
            plan,
            orchestrator: OrchestratorOptions::default(),
            mode: UpdateMode::Auto,
            controller: 0,
            dry_run: false,
        }
    }

    pub fn mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn orchestrator_options(mut self, options: OrchestratorOptions) -> Self {
        self.orchestrator = options;
        self
    }

    pub fn controller(mut self, controller: u32) -> Self {
        self.controller = controller;
        self
    }

    /// Stop after the decision
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Run against the first component the collector finds
    pub async fn run(&self, factory: Arc<dyn SessionFactory>) -> Result<JobOutcome> {
        let registry = self.catalog.registry(self.kind)?;
        let forced = self.forced_target(&registry)?;

        let mut session = factory.connect().await?;
        let outcome = match self.collector.detect(&mut session).await {
            Ok(detected) => {
                self.update(&mut session, &registry, forced.as_ref(), detected, factory)
                    .await
            }
            Err(e) => Err(e),
        };
        session.disconnect().await;
        outcome
    }

    /// Run against every eligible component on the host, in detection order.
    /// Forced mode still updates exactly one: the detected part the model
    /// map expects, or the first one found.
    pub async fn run_all(&self, factory: Arc<dyn SessionFactory>) -> Result<Vec<JobOutcome>> {
        let registry = self.catalog.registry(self.kind)?;
        let forced = self.forced_target(&registry)?;

        let mut session = factory.connect().await?;
        let outcomes = self
            .run_components(&mut session, &registry, forced.as_ref(), factory)
            .await;
        session.disconnect().await;
        outcomes
    }

    // Policy problems surface before anything touches the network
    fn forced_target(&self, registry: &PolicyRegistry) -> Result<Option<ForcedTarget>> {
        match &self.mode {
            UpdateMode::Auto => Ok(None),
            UpdateMode::Forced {
                model,
                slot,
                version,
            } => plan_forced(registry, self.catalog.models(), model, slot, version).map(Some),
        }
    }

    async fn run_components(
        &self,
        session: &mut Session,
        registry: &PolicyRegistry,
        forced: Option<&ForcedTarget>,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Vec<JobOutcome>> {
        let mut detected = self.collector.detect_all(session).await?;
        if let Some(target) = forced {
            let pick = detected
                .iter()
                .position(|d| d.identity == target.expected)
                .unwrap_or(0);
            detected = detected.into_iter().skip(pick).take(1).collect();
        }

        let mut outcomes = Vec::with_capacity(detected.len());
        for component in detected {
            let outcome = self
                .update(session, registry, forced, component, factory.clone())
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn update(
        &self,
        session: &mut Session,
        registry: &PolicyRegistry,
        forced: Option<&ForcedTarget>,
        detected: Detected,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<JobOutcome> {
        let Detected { identity, version } = detected;
        info!(
            "{}: {} {} at version {}",
            session.host(),
            self.kind,
            identity,
            version
        );

        let decision = match forced {
            Some(target) => target.verify(&identity, &version)?,
            None => decide(registry, &identity, &version)?,
        };
        info!(
            "{}: {} -> {}: {}",
            session.host(),
            decision.current,
            decision.target,
            decision.outcome
        );

        let required = match decision.clone().into_required()? {
            Some(required) => required,
            None => return Ok(JobOutcome::NoUpdate(decision)),
        };
        if self.dry_run {
            return Ok(JobOutcome::Planned(required));
        }

        let orchestrator = UpdateOrchestrator::new(factory, self.orchestrator.clone());
        let report = orchestrator
            .apply(session, &required, &self.plan, self.controller)
            .await?;
        Ok(JobOutcome::Applied {
            decision: required,
            report,
        })
    }
}
