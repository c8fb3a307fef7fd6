//! Apply orchestration
//!
//! One cycle walks `Idle -> Resolving -> Rendering -> Finalizing -> Idle`:
//!
//! - **Resolving**: every rule is resolved to its targets and rendered in
//!   memory. Any fatal error here (conflicting target, discovery failure,
//!   invalid chain target) aborts before a single artifact is touched.
//! - **Rendering**: each prepared artifact is compared with the store and
//!   activated only if it differs.
//! - **Finalizing**: the rebuild action runs exactly once; the reload action
//!   runs once more only if some artifact changed.
//!
//! However many rules and addresses a cycle covers, it costs at most one
//! rebuild and one reload.

use crate::core::error::{Error, Result};
use crate::core::render::{ArtifactStore, PreparedArtifact, activate, prepare};
use crate::core::resolve::{DiscoveryPort, TagSelector, resolve, target_inputs};
use crate::core::rules::AtomicRule;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Zero-argument host side effect (rule rebuild, kernel parameter reload)
pub trait HostAction {
    /// Short human-readable description for logs
    fn describe(&self) -> String;

    /// Runs the action. Any failure is fatal to the cycle.
    fn run(&self) -> impl Future<Output = Result<()>>;
}

/// Runs an external program with fixed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds an action from an argv vector (`["sysctl", "-e", "-p"]`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the vector is empty.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("command cannot be empty".to_string()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl HostAction for CommandAction {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    async fn run(&self) -> Result<()> {
        info!("Running {}", self.describe());

        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Action {
                    program: self.program.clone(),
                    exit_code: None,
                    stderr: e.to_string(),
                }
            })?;

        if output.status.success() {
            debug!("{} completed", self.program);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{} failed: {stderr}", self.describe());
            Err(Error::Action {
                program: self.program.clone(),
                exit_code: output.status.code(),
                stderr,
            })
        }
    }
}

/// Action that only logs what it would have run
#[derive(Debug, Clone)]
pub struct DryRunAction {
    description: String,
}

impl DryRunAction {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

impl HostAction for DryRunAction {
    fn describe(&self) -> String {
        self.description.clone()
    }

    async fn run(&self) -> Result<()> {
        info!("Would run {}", self.description);
        Ok(())
    }
}

/// Phase of the apply state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum CyclePhase {
    #[default]
    Idle,
    Resolving,
    Rendering,
    Finalizing,
}

/// An artifact that was written or removed during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactChange {
    pub name: String,
    pub enable: bool,
    pub sha256: String,
}

/// Aggregate result of one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    /// True iff at least one artifact was written or removed
    pub any_changed: bool,
    /// Artifacts compared against the store
    pub rendered: usize,
    pub changes: Vec<ArtifactChange>,
    /// Rules whose target set came back empty
    pub skipped_rules: usize,
    /// Artifacts overridden by a later rule with the same name
    pub superseded: usize,
    pub rebuilt: bool,
    pub reloaded: bool,
    /// Cycle short-circuited by the global enable switch
    pub disabled: bool,
    pub cycle_id: Option<Uuid>,
}

impl ApplyOutcome {
    fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }
}

/// Sequences resolution, rendering and the rebuild/reload actions
pub struct Orchestrator<D, S, B, R> {
    enabled: bool,
    selector: Option<TagSelector>,
    discovery: D,
    store: S,
    rebuild: B,
    reload: R,
    phase: CyclePhase,
}

impl<D, S, B, R> Orchestrator<D, S, B, R>
where
    D: DiscoveryPort,
    S: ArtifactStore,
    B: HostAction,
    R: HostAction,
{
    /// Creates an enabled orchestrator with no tag selector
    pub fn new(discovery: D, store: S, rebuild: B, reload: R) -> Self {
        Self {
            enabled: true,
            selector: None,
            discovery,
            store,
            rebuild,
            reload,
            phase: CyclePhase::Idle,
        }
    }

    /// Sets the global enable switch
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Resolves address-less rules through discovery instead of "any"
    pub fn with_selector(mut self, selector: Option<TagSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn rebuild_action(&self) -> &B {
        &self.rebuild
    }

    pub fn reload_action(&self) -> &R {
        &self.reload
    }

    /// Runs one full cycle over `rules`.
    ///
    /// # Errors
    ///
    /// Misconfiguration and discovery errors abort before any artifact is
    /// activated. Store and action failures abort the remainder of the cycle.
    pub async fn apply_all(&mut self, rules: &[AtomicRule]) -> Result<ApplyOutcome> {
        if !self.enabled {
            warn!("Firewall not enabled; not applying {} rule(s)", rules.len());
            return Ok(ApplyOutcome::disabled());
        }

        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", id = %cycle_id);
        let result = self.run_cycle(rules, cycle_id).instrument(span).await;
        self.phase = CyclePhase::Idle;
        result
    }

    async fn run_cycle(&mut self, rules: &[AtomicRule], cycle_id: Uuid) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome {
            cycle_id: Some(cycle_id),
            ..ApplyOutcome::default()
        };

        self.enter(CyclePhase::Resolving);
        let planned = self.plan(rules, &mut outcome)?;

        self.enter(CyclePhase::Rendering);
        for prepared in planned {
            let artifact = activate(prepared, &mut self.store)?;
            outcome.rendered += 1;
            if artifact.changed {
                outcome.any_changed = true;
                outcome.changes.push(ArtifactChange {
                    sha256: artifact.digest(),
                    name: artifact.name,
                    enable: artifact.enable,
                });
            }
        }

        self.enter(CyclePhase::Finalizing);
        self.rebuild.run().await?;
        outcome.rebuilt = true;

        if outcome.any_changed {
            self.reload.run().await?;
            outcome.reloaded = true;
        } else {
            debug!("No artifact changed; skipping {}", self.reload.describe());
        }

        info!(
            "Cycle complete: {} rule(s), {} artifact(s), {} changed, {} skipped, {} superseded",
            rules.len(),
            outcome.rendered,
            outcome.changes.len(),
            outcome.skipped_rules,
            outcome.superseded
        );
        Ok(outcome)
    }

    /// Resolves and renders every rule without touching the store.
    ///
    /// Artifact names ignore target and enable, so two rules can land on the
    /// same name. The later rule wins, keeping the first one's position;
    /// otherwise both would be written in turn and every cycle would change.
    fn plan(
        &self,
        rules: &[AtomicRule],
        outcome: &mut ApplyOutcome,
    ) -> Result<Vec<PreparedArtifact>> {
        let mut planned: Vec<PreparedArtifact> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for rule in rules {
            let (explicit, selector) = target_inputs(rule, self.selector.as_ref());
            let targets =
                resolve(rule, explicit, selector, &self.discovery).inspect_err(|e| {
                    error!("Aborting cycle at rule '{rule}': {e}");
                })?;

            if targets.is_empty() {
                info!("No targets for rule '{rule}'; skipping");
                outcome.skipped_rules += 1;
                continue;
            }

            for target in &targets {
                debug!("Updating rule '{rule}' for address {target}");
                let prepared = prepare(rule, target).inspect_err(|e| {
                    error!("Aborting cycle at rule '{rule}': {e}");
                })?;

                if let Some(&index) = positions.get(&prepared.name) {
                    warn!(
                        "Rule '{rule}' overrides an earlier rule for artifact {}",
                        prepared.name
                    );
                    outcome.superseded += 1;
                    planned[index] = prepared;
                } else {
                    positions.insert(prepared.name.clone(), planned.len());
                    planned.push(prepared);
                }
            }
        }

        Ok(planned)
    }

    fn enter(&mut self, phase: CyclePhase) {
        debug!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }
}
