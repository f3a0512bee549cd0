//! Pipeline orchestrator.
//!
//! [`Pipeline::dispatch`] evaluates an event and, when accepted, fans out
//! one Run per matrix entry. Each Run executes its stages strictly in order
//! and stops at the first failure:
//!
//! ```text
//! fetch -> provision -> build -> test
//! ```
//!
//! Runs share only the immutable config, the ledger and the toolchain cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tidewater_state::{RunId, RunLedger};
use tracing::{debug, info, Instrument};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, RunError, StageError};
use crate::executor::{render_command, ProjectExecutor};
use crate::fetch::{fetch_with_retry, GitFetcher, WorkspaceFetcher};
use crate::matrix::{Matrix, MatrixEntry};
use crate::obs;
use crate::recording::RunRecorder;
use crate::registry::{CancelToken, RunRegistry};
use crate::run::{Run, RunReport};
use crate::stage::StageKind;
use crate::toolchain::{Provisioner, RustupProvisioner, ToolchainCache, ToolchainSpec};
use crate::trigger::{EventKind, RepoEvent, TriggerDecision, TriggerEvaluator};

/// Result of dispatching one repository event.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub decision: TriggerDecision,
    /// One report per matrix entry, in matrix order. Empty when rejected.
    pub runs: Vec<RunReport>,
}

impl DispatchResult {
    /// True when every Run succeeded (vacuously true for a rejected event).
    pub fn all_succeeded(&self) -> bool {
        self.runs.iter().all(RunReport::succeeded)
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    matrix: Matrix,
    trigger: TriggerEvaluator,
    fetcher: Arc<dyn WorkspaceFetcher>,
    toolchains: ToolchainCache,
    executor: ProjectExecutor,
    ledger: Arc<dyn RunLedger>,
    registry: RunRegistry,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<dyn WorkspaceFetcher>,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<dyn RunLedger>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let matrix = config.matrix()?;
        let trigger = TriggerEvaluator::new(config.trigger.branch.clone());
        let executor = ProjectExecutor::new(
            config.commands.timeout_secs,
            config.commands.output_tail_lines,
        );

        Ok(Self {
            config: Arc::new(config),
            matrix,
            trigger,
            fetcher,
            toolchains: ToolchainCache::new(provisioner),
            executor,
            ledger,
            registry: RunRegistry::new(),
        })
    }

    /// Pipeline backed by `git` and `rustup`.
    pub fn from_config(
        config: PipelineConfig,
        ledger: Arc<dyn RunLedger>,
    ) -> Result<Self, ConfigError> {
        let fetcher = Arc::new(GitFetcher::new(config.fetch.remote.clone()));
        Self::new(config, fetcher, Arc::new(RustupProvisioner::new()), ledger)
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Trigger decision for `event`, without starting anything.
    pub fn evaluate(&self, event: &RepoEvent) -> TriggerDecision {
        let decision = self.trigger.evaluate(event);
        let branch = match event.kind {
            EventKind::Push => &event.source_branch,
            EventKind::PullRequest => &event.destination_branch,
        };
        obs::emit_trigger_evaluated(event.kind.name(), branch, decision.is_accepted());
        decision
    }

    /// Evaluate `event` and run every matrix entry for it concurrently.
    ///
    /// In-flight Runs of the same concurrency group are cancelled first.
    pub async fn dispatch(self: &Arc<Self>, event: RepoEvent) -> Result<DispatchResult, RunError> {
        let decision = self.evaluate(&event);
        if !decision.is_accepted() {
            return Ok(DispatchResult {
                decision,
                runs: Vec::new(),
            });
        }

        let group = event.concurrency_group();
        let superseded = self.registry.supersede(&group);
        if superseded > 0 {
            info!(group = %group, superseded, "Cancelled superseded runs");
        }

        let tasks: Vec<_> = self
            .matrix
            .entries()
            .iter()
            .map(|entry| {
                let run_id = RunId::new();
                let cancel = self.registry.register(&group, &run_id);
                let span = obs::run_span(&run_id.to_string(), &entry.target);
                let pipeline = Arc::clone(self);
                let event = event.clone();
                let entry = entry.clone();
                let group = group.clone();

                tokio::spawn(
                    async move {
                        let report = pipeline
                            .execute(run_id.clone(), &event, entry, cancel)
                            .await;
                        pipeline.registry.release(&group, &run_id);
                        report
                    }
                    .instrument(span),
                )
            })
            .collect();

        let mut runs = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            runs.push(joined??);
        }

        Ok(DispatchResult { decision, runs })
    }

    /// Execute one Run to a terminal state.
    ///
    /// Stage failures end the Run and are reported in the returned
    /// [`RunReport`]; only orchestrator faults are returned as errors.
    pub async fn execute(
        &self,
        run_id: RunId,
        event: &RepoEvent,
        entry: MatrixEntry,
        cancel: CancelToken,
    ) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let toolchain = self.config.toolchain_for(&entry);
        let mut run = Run::new(run_id, event, self.trigger.target_branch(), entry, toolchain);
        let mut recorder = RunRecorder::start(Arc::clone(&self.ledger), &run).await?;

        if let Err(e) = self.run_stages(&mut run, &mut recorder, &cancel).await {
            let run_id = run.run_id.to_string();
            obs::emit_ledger_error(&run_id, &e);
            // Still finalize the ledger run; a non-terminal Run is recorded as failed.
            let duration_ms = started.elapsed().as_millis() as u64;
            if let Err(finish_error) = recorder.finish(&run, duration_ms).await {
                obs::emit_ledger_error(&run_id, &finish_error);
            }
            return Err(e);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        recorder.finish(&run, duration_ms).await?;
        Ok(run.report(duration_ms))
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        recorder: &mut RunRecorder,
        cancel: &CancelToken,
    ) -> Result<(), RunError> {
        let commit_ref = run.commit_ref.clone();
        let toolchain = run.toolchain.clone();

        let fetch = self.fetcher.describe(&commit_ref);
        let fetched = self
            .run_stage(run, recorder, cancel, StageKind::Fetch, fetch, async {
                let (workspace, attempts) =
                    fetch_with_retry(self.fetcher.as_ref(), &commit_ref, self.config.retry_policy())
                        .await?;
                debug!(attempts, sha = workspace.resolved_sha(), "Workspace ready");
                Ok::<_, StageError>((workspace, None))
            })
            .await?;
        // The workspace is removed when this binding drops.
        let Some(workspace) = fetched else {
            return Ok(());
        };

        let provisioned = self
            .run_stage(
                run,
                recorder,
                cancel,
                StageKind::Provision,
                provision_command(&toolchain),
                async {
                    let outcome = self.toolchains.ensure(&toolchain).await?;
                    debug!(?outcome, toolchain = %toolchain, "Toolchain active");
                    Ok::<_, StageError>(((), None))
                },
            )
            .await?;
        if provisioned.is_none() {
            return Ok(());
        }

        let build = render_command(&self.config.commands.build, &toolchain);
        let built = self
            .run_stage(run, recorder, cancel, StageKind::Build, build.clone(), async {
                let output = self.executor.build(build, &toolchain, workspace.path()).await?;
                Ok::<_, StageError>(((), Some(output.exit_code)))
            })
            .await?;
        if built.is_none() {
            return Ok(());
        }

        let test = render_command(&self.config.commands.test, &toolchain);
        let tested = self
            .run_stage(run, recorder, cancel, StageKind::Test, test.clone(), async {
                let output = self.executor.test(test, &toolchain, workspace.path()).await?;
                Ok::<_, StageError>(((), Some(output.exit_code)))
            })
            .await?;
        if tested.is_some() {
            run.succeed()?;
        }
        Ok(())
    }

    /// Run one stage, racing it against cancellation.
    ///
    /// Returns `None` when the stage failed or was aborted; the Run is
    /// terminal in that case.
    async fn run_stage<T, F>(
        &self,
        run: &mut Run,
        recorder: &mut RunRecorder,
        cancel: &CancelToken,
        kind: StageKind,
        command: Vec<String>,
        stage: F,
    ) -> Result<Option<T>, RunError>
    where
        F: Future<Output = Result<(T, Option<i32>), StageError>>,
    {
        if cancel.is_cancelled() {
            run.abort(kind)?;
            return Ok(None);
        }

        run.begin_stage(kind, command.clone())?;
        recorder.stage_started(kind, &command).await?;
        let started = Instant::now();

        // Dropping the stage future kills its process group.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Aborted { stage: kind }),
            result = stage => result,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((value, exit_code)) => {
                run.complete_stage(exit_code, duration_ms)?;
                recorder.stage_succeeded(kind, exit_code, duration_ms).await?;
                Ok(Some(value))
            }
            Err(error) => {
                run.fail_stage(&error, duration_ms)?;
                recorder.stage_failed(kind, &error, duration_ms).await?;
                Ok(None)
            }
        }
    }
}

fn provision_command(toolchain: &ToolchainSpec) -> Vec<String> {
    [
        "rustup",
        "toolchain",
        "install",
        toolchain.channel.as_str(),
        "--profile",
        toolchain.profile.as_str(),
        "--target",
        toolchain.target.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
