//! Update Orchestrator
//!
//! Drives an [`ApplyPlan`] over a live session once the decision engine has
//! called for an update: every image the plan touches is checked for on the
//! host, then the steps run in order. Each step's output is classified by
//! its completion markers. A reboot request reboots the host, reconnects
//! through the [`SessionFactory`], and runs the same step again; only one
//! reboot is allowed per apply.
//!
//! Nothing is rolled back. A failing step stops the sequence and the error
//! lists which steps had already finished and which never ran.

pub mod plan;
pub mod presets;

pub use plan::{
    ApplyPlan, ApplyStep, CompiledMarkers, Completion, CompletionMarkers, RebootSpec,
    RenderContext,
};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::decision::UpdateDecision;
use crate::error::{Error, Result};
use crate::policy::ArtifactLocation;
use crate::session::{Session, SessionFactory};
use crate::transaction::{self, Transaction};

/// Timing and layout knobs shared by every plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Wait between the reboot command and the reconnect
    pub reboot_settle: Duration,
    /// Extra wait after a successful reconnect
    pub reconnect_settle: Duration,
    /// Value of `{tools_dir}` in plan templates
    pub tools_dir: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            reboot_settle: Duration::from_secs(320),
            reconnect_settle: Duration::ZERO,
            tools_dir: "/usr/bin".to_string(),
        }
    }
}

/// Overall result of a successful apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyOutcome {
    Completed,
    /// Flashed, but the new image is only active after a power cycle
    PowerCycleRequired,
}

/// How one step went
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub label: String,
    pub completion: Completion,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcome: ApplyOutcome,
    pub artifact: ArtifactLocation,
    /// One entry per step run, including the run that asked for a reboot
    pub steps: Vec<StepReport>,
    pub reboots: u32,
}

/// Applies firmware images according to a plan
pub struct UpdateOrchestrator {
    factory: Arc<dyn SessionFactory>,
    options: OrchestratorOptions,
}

impl UpdateOrchestrator {
    /// `factory` must open sessions to the same host the caller's session
    /// is connected to
    pub fn new(factory: Arc<dyn SessionFactory>, options: OrchestratorOptions) -> Self {
        Self { factory, options }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Apply `decision` on `session`.
    ///
    /// After a reboot `session` is replaced by the fresh one. Step failures
    /// come back as [`Error::Apply`]; session faults and cancellation are
    /// returned unchanged.
    pub async fn apply(
        &self,
        session: &mut Session,
        decision: &UpdateDecision,
        plan: &ApplyPlan,
        controller: u32,
    ) -> Result<ApplyReport> {
        let artifact = decision.required_artifact()?.clone();
        let markers = plan
            .steps
            .iter()
            .map(|step| step.markers.compile())
            .collect::<Result<Vec<_>>>()?;
        let labels = plan.labels();
        let ctx = RenderContext::new(artifact.clone(), self.options.tools_dir.clone(), controller);

        info!(
            "{}: applying {} {} -> {} ({} step(s))",
            session.host(),
            decision.identity,
            decision.current,
            decision.target,
            plan.steps.len()
        );

        for path in plan.artifact_paths(&ctx) {
            if !self.artifact_present(session, plan, &ctx, &path).await? {
                return Err(Error::Apply {
                    step: None,
                    reason: format!("image {} not found on host", path),
                    completed: Vec::new(),
                    skipped: labels,
                });
            }
            debug!("{}: found {}", session.host(), path);
        }

        let mut report = ApplyReport {
            outcome: ApplyOutcome::Completed,
            artifact,
            steps: Vec::with_capacity(plan.steps.len()),
            reboots: 0,
        };

        for (index, step) in plan.steps.iter().enumerate() {
            loop {
                let (completion, retries) = self
                    .run_step(session, index, step, &markers[index], &ctx, &labels)
                    .await?;
                report.steps.push(StepReport {
                    index,
                    label: step.label.clone(),
                    completion,
                    retries,
                });

                match completion {
                    Completion::Completed => break,
                    Completion::PowerCycleRequired => {
                        warn!(
                            "{}: step '{}' needs a power cycle to take effect",
                            session.host(),
                            step.label
                        );
                        report.outcome = ApplyOutcome::PowerCycleRequired;
                        break;
                    }
                    Completion::RebootThenRetryRequired if report.reboots > 0 => {
                        return Err(step_failure(
                            index,
                            &labels,
                            "tool asked for a reboot again after the host was rebooted",
                        ));
                    }
                    Completion::RebootThenRetryRequired => {
                        info!(
                            "{}: step '{}' requires a reboot, then a retry",
                            session.host(),
                            step.label
                        );
                        self.reboot_and_reconnect(session, &plan.reboot).await?;
                        report.reboots += 1;
                    }
                }
            }
        }

        info!(
            "{}: apply finished: {:?} after {} reboot(s)",
            session.host(),
            report.outcome,
            report.reboots
        );
        Ok(report)
    }

    /// Listing output must be exactly `path`; a timeout counts as absent
    async fn artifact_present(
        &self,
        session: &mut Session,
        plan: &ApplyPlan,
        ctx: &RenderContext,
        path: &str,
    ) -> Result<bool> {
        let tx = Transaction::new(ctx.render(&plan.existence_command, path))
            .expect_prompt()
            .timeout(Duration::from_secs(plan.existence_timeout_secs))
            .attempts(1);
        let result = transaction::execute_tolerant(session, &tx).await?;
        Ok(result.is_success() && result.body().trim() == path)
    }

    async fn run_step(
        &self,
        session: &mut Session,
        index: usize,
        step: &ApplyStep,
        markers: &CompiledMarkers,
        ctx: &RenderContext,
        labels: &[String],
    ) -> Result<(Completion, u32)> {
        let tx = step.transaction(ctx, markers)?;
        debug!(
            "{}: step {} '{}': {}",
            session.host(),
            index + 1,
            step.label,
            tx.command()
        );

        let result = match session.execute(&tx).await {
            Ok(result) => result,
            Err(Error::Timeout { retries, .. }) => {
                return Err(step_failure(
                    index,
                    labels,
                    format!(
                        "no completion within {}s after {} retries",
                        step.timeout_secs, retries
                    ),
                ));
            }
            Err(e) => return Err(e),
        };

        // The echoed command line is not tool output
        let completion = markers
            .classify(&result.body())
            .map_err(|reason| step_failure(index, labels, reason))?;

        if completion != Completion::RebootThenRetryRequired {
            if let Some(secs) = step.sync_prompt_secs {
                let sync = Transaction::new(" ")
                    .expect_prompt()
                    .timeout(Duration::from_secs(secs))
                    .attempts(1);
                let synced = transaction::execute_tolerant(session, &sync).await?;
                if !synced.is_success() {
                    warn!(
                        "{}: prompt did not return within {}s after '{}'",
                        session.host(),
                        secs,
                        step.label
                    );
                }
            }
            if step.settle_secs > 0 {
                debug!("{}: settling {}s after '{}'", session.host(), step.settle_secs, step.label);
                pause(
                    session.cancellation(),
                    Duration::from_secs(step.settle_secs),
                    &step.label,
                )
                .await?;
            }
        }

        Ok((completion, result.retries))
    }

    /// Reboot the host and swap `session` for a fresh one
    async fn reboot_and_reconnect(&self, session: &mut Session, reboot: &RebootSpec) -> Result<()> {
        let tx = reboot.transaction()?;
        match transaction::execute_tolerant(session, &tx).await {
            Ok(result) if !result.is_success() => {
                warn!("{}: no reboot confirmation, continuing", session.host());
            }
            Ok(_) => {}
            Err(e) if e.is_session_fault() => {
                debug!("{}: connection dropped during reboot: {}", session.host(), e);
            }
            Err(e) => return Err(e),
        }

        info!(
            "{}: waiting {:?} for the host to come back",
            session.host(),
            self.options.reboot_settle
        );
        pause(session.cancellation(), self.options.reboot_settle, "reboot").await?;

        let fresh = self.factory.connect().await?;
        let old = std::mem::replace(session, fresh);
        old.disconnect().await;

        if !self.options.reconnect_settle.is_zero() {
            pause(session.cancellation(), self.options.reconnect_settle, "reconnect").await?;
        }
        Ok(())
    }
}

/// Sleep that still honours a cancellation token
async fn pause(cancel: CancellationToken, duration: Duration, what: &str) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled {
            command: what.to_string(),
        }),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn step_failure(index: usize, labels: &[String], reason: impl Into<String>) -> Error {
    Error::Apply {
        step: Some(index),
        reason: reason.into(),
        completed: labels[..index].to_vec(),
        skipped: labels[index + 1..].to_vec(),
    }
}
