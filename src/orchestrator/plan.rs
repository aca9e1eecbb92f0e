//! Apply plans
//!
//! A plan is data: an existence-check template, a reboot recipe, and an
//! ordered list of vendor-tool steps with their completion patterns and
//! markers. Built-in plans cover each family; configuration may replace
//! them wholesale.
//!
//! Templates understand these placeholders:
//!
//! | Placeholder       | Value                                         |
//! |-------------------|-----------------------------------------------|
//! | `{file}`          | the step's own image (defaults to `{artifact}`) |
//! | `{artifact}`      | image chosen by the decision engine           |
//! | `{artifact_dir}`  | directory of `{artifact}`                     |
//! | `{artifact_name}` | file name of `{artifact}`                     |
//! | `{tools_dir}`     | directory holding the vendor tools            |
//! | `{controller}`    | controller index for multi-adapter hosts      |

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{ArtifactLocation, ComponentKind};
use crate::transaction::{Pattern, PatternSpec, Transaction};

/// How a finished step left the component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    Completed,
    /// The tool wants the host rebooted and the step run again
    RebootThenRetryRequired,
    /// The new image activates only after a power cycle
    PowerCycleRequired,
}

/// Output markers that classify a step's result. All are regexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionMarkers {
    #[serde(default)]
    pub success: Vec<String>,
    /// Fail the step unless a success marker is present
    #[serde(default)]
    pub require_success: bool,
    #[serde(default)]
    pub reboot: Vec<String>,
    #[serde(default)]
    pub power_cycle: Vec<String>,
    #[serde(default)]
    pub failure: Vec<String>,
}

/// [`CompletionMarkers`] with compiled expressions
#[derive(Debug, Clone)]
pub struct CompiledMarkers {
    success: Vec<Regex>,
    require_success: bool,
    reboot: Vec<Regex>,
    power_cycle: Vec<Regex>,
    failure: Vec<Regex>,
}

fn compile_all(exprs: &[String]) -> Result<Vec<Regex>> {
    exprs
        .iter()
        .map(|expr| Regex::new(expr).map_err(Error::from))
        .collect()
}

impl CompletionMarkers {
    pub fn compile(&self) -> Result<CompiledMarkers> {
        Ok(CompiledMarkers {
            success: compile_all(&self.success)?,
            require_success: self.require_success,
            reboot: compile_all(&self.reboot)?,
            power_cycle: compile_all(&self.power_cycle)?,
            failure: compile_all(&self.failure)?,
        })
    }
}

impl CompiledMarkers {
    /// Patterns that also end the wait, so a reboot request is seen even when
    /// the tool never prints its normal completion text
    pub fn wait_patterns(&self) -> impl Iterator<Item = Pattern> + '_ {
        self.reboot.iter().cloned().map(Pattern::Regex)
    }

    /// Classify step output. Precedence: failure, power cycle, reboot,
    /// missing required success. `Err` carries the failure reason.
    pub fn classify(&self, output: &str) -> std::result::Result<Completion, String> {
        if let Some(m) = self.failure.iter().find_map(|re| re.find(output)) {
            return Err(format!("failure marker '{}' in tool output", m.as_str()));
        }
        if self.power_cycle.iter().any(|re| re.is_match(output)) {
            return Ok(Completion::PowerCycleRequired);
        }
        if self.reboot.iter().any(|re| re.is_match(output)) {
            return Ok(Completion::RebootThenRetryRequired);
        }
        if self.require_success && !self.success.iter().any(|re| re.is_match(output)) {
            return Err("tool output has no success marker".to_string());
        }
        Ok(Completion::Completed)
    }
}

fn default_expect() -> Vec<PatternSpec> {
    vec![PatternSpec::Prompt]
}

fn default_step_timeout() -> u64 {
    30
}

fn default_attempts() -> u32 {
    1
}

/// One vendor-tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyStep {
    pub label: String,
    pub command: String,
    /// Template for this step's image; `{artifact}` when absent
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default = "default_expect")]
    pub expect: Vec<PatternSpec>,
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub markers: CompletionMarkers,
    /// Send a blank line and wait this long for the prompt afterwards
    #[serde(default)]
    pub sync_prompt_secs: Option<u64>,
    /// Pause after the step completes
    #[serde(default)]
    pub settle_secs: u64,
}

impl ApplyStep {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            artifact: None,
            expect: default_expect(),
            timeout_secs: default_step_timeout(),
            attempts: default_attempts(),
            markers: CompletionMarkers::default(),
            sync_prompt_secs: None,
            settle_secs: 0,
        }
    }

    pub fn artifact(mut self, template: impl Into<String>) -> Self {
        self.artifact = Some(template.into());
        self
    }

    /// Replace the default prompt wait with `patterns`
    pub fn until(mut self, patterns: impl IntoIterator<Item = PatternSpec>) -> Self {
        self.expect = patterns.into_iter().collect();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn require(mut self, success: impl Into<String>) -> Self {
        self.markers.success.push(success.into());
        self.markers.require_success = true;
        self
    }

    pub fn reboot_on(mut self, marker: impl Into<String>) -> Self {
        self.markers.reboot.push(marker.into());
        self
    }

    pub fn power_cycle_on(mut self, marker: impl Into<String>) -> Self {
        self.markers.power_cycle.push(marker.into());
        self
    }

    pub fn fail_on(mut self, marker: impl Into<String>) -> Self {
        self.markers.failure.push(marker.into());
        self
    }

    pub fn sync_prompt(mut self, secs: u64) -> Self {
        self.sync_prompt_secs = Some(secs);
        self
    }

    pub fn settle(mut self, secs: u64) -> Self {
        self.settle_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Image path for this step
    pub fn file(&self, ctx: &RenderContext) -> String {
        ctx.render(self.artifact.as_deref().unwrap_or("{artifact}"), "")
    }

    /// Transaction for this step: command plus expected patterns and any
    /// patterns the markers need to end the wait
    pub fn transaction(&self, ctx: &RenderContext, markers: &CompiledMarkers) -> Result<Transaction> {
        let command = ctx.render(&self.command, &self.file(ctx));
        let mut tx = Transaction::new(command)
            .timeout(self.timeout())
            .attempts(self.attempts);
        for spec in &self.expect {
            tx = tx.expect(spec.compile()?);
        }
        for pattern in markers.wait_patterns() {
            tx = tx.expect(pattern);
        }
        Ok(tx)
    }
}

/// How to reboot the host when a step asks for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebootSpec {
    pub command: String,
    pub expect: Vec<PatternSpec>,
    pub timeout_secs: u64,
}

impl Default for RebootSpec {
    fn default() -> Self {
        Self {
            command: "reboot -f".to_string(),
            expect: vec![PatternSpec::exact("Rebooting.")],
            timeout_secs: 30,
        }
    }
}

impl RebootSpec {
    pub fn transaction(&self) -> Result<Transaction> {
        let mut tx = Transaction::new(&self.command)
            .timeout(Duration::from_secs(self.timeout_secs))
            .attempts(1);
        for spec in &self.expect {
            tx = tx.expect(spec.compile()?);
        }
        Ok(tx)
    }
}

fn default_existence_command() -> String {
    "ls {file}".to_string()
}

fn default_existence_timeout() -> u64 {
    10
}

/// Ordered apply procedure for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyPlan {
    /// Listing command whose output must be exactly the image path
    #[serde(default = "default_existence_command")]
    pub existence_command: String,
    #[serde(default = "default_existence_timeout")]
    pub existence_timeout_secs: u64,
    #[serde(default)]
    pub reboot: RebootSpec,
    pub steps: Vec<ApplyStep>,
}

impl ApplyPlan {
    pub fn new(steps: Vec<ApplyStep>) -> Self {
        Self {
            existence_command: default_existence_command(),
            existence_timeout_secs: default_existence_timeout(),
            reboot: RebootSpec::default(),
            steps,
        }
    }

    /// Built-in plan for `kind`
    pub fn builtin(kind: ComponentKind) -> Self {
        super::presets::builtin(kind)
    }

    pub fn labels(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.label.clone()).collect()
    }

    /// Distinct images the plan touches, primary first
    pub fn artifact_paths(&self, ctx: &RenderContext) -> Vec<String> {
        let mut paths = vec![ctx.artifact.as_str().to_string()];
        for step in &self.steps {
            let file = step.file(ctx);
            if !paths.contains(&file) {
                paths.push(file);
            }
        }
        paths
    }

    /// Reject plans that could only fail at run time
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::ConfigValidationFailed {
                field: "steps".to_string(),
                reason: "an apply plan needs at least one step".to_string(),
            });
        }
        for (index, step) in self.steps.iter().enumerate() {
            let field = format!("steps[{}] ({})", index, step.label);
            if step.expect.is_empty() && step.markers.reboot.is_empty() {
                return Err(Error::ConfigValidationFailed {
                    field,
                    reason: "step has nothing to wait for".to_string(),
                });
            }
            if step.timeout_secs == 0 || step.attempts == 0 {
                return Err(Error::ConfigValidationFailed {
                    field,
                    reason: "timeout and attempts must be greater than 0".to_string(),
                });
            }
            for spec in &step.expect {
                spec.compile().map_err(|e| Error::ConfigValidationFailed {
                    field: field.clone(),
                    reason: e.to_string(),
                })?;
            }
            step.markers
                .compile()
                .map_err(|e| Error::ConfigValidationFailed {
                    field: field.clone(),
                    reason: e.to_string(),
                })?;
        }
        self.reboot.transaction()?;
        Ok(())
    }
}

/// Values substituted into plan templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub artifact: ArtifactLocation,
    pub tools_dir: String,
    pub controller: u32,
}

impl RenderContext {
    pub fn new(artifact: ArtifactLocation, tools_dir: impl Into<String>, controller: u32) -> Self {
        Self {
            artifact,
            tools_dir: tools_dir.into(),
            controller,
        }
    }

    /// Fill in `template`; `file` is the value of `{file}`
    pub fn render(&self, template: &str, file: &str) -> String {
        template
            .replace("{file}", file)
            .replace("{artifact_dir}", self.artifact.dir())
            .replace("{artifact_name}", self.artifact.file_name())
            .replace("{artifact}", self.artifact.as_str())
            .replace("{tools_dir}", self.tools_dir.trim_end_matches('/'))
            .replace("{controller}", &self.controller.to_string())
    }
}
