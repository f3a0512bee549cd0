//! Mirrors a Run's lifecycle into a [`RunLedger`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tidewater_state::{RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult};

use crate::error::StageError;
use crate::obs;
use crate::run::{Run, RunOutcome};
use crate::stage::StageKind;

pub const STAGE_STARTED: &str = "stage_started";
pub const STAGE_SUCCEEDED: &str = "stage_succeeded";
pub const STAGE_FAILED: &str = "stage_failed";

/// Records stage events for one Run.
///
/// 1. [`RunRecorder::start`] creates the ledger run.
/// 2. `stage_*` append events with increasing `seq`.
/// 3. [`RunRecorder::finish`] finalizes by outcome.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    seq: u64,
}

impl RunRecorder {
    pub async fn start(ledger: Arc<dyn RunLedger>, run: &Run) -> StorageResult<Self> {
        let metadata = RunMetadata {
            commit_ref: run.commit_ref.clone(),
            target: run.entry.target.clone(),
            tags: json!({
                "event_kind": run.event_kind,
                "target_branch": run.target_branch,
                "toolchain": run.toolchain,
            }),
        };
        ledger
            .create_run(&run.run_id, &run.spec_digest(), metadata)
            .await?;
        obs::emit_run_started(&run.run_id.to_string(), &run.commit_ref, &run.entry.target);

        Ok(Self {
            ledger,
            run_id: run.run_id.clone(),
            seq: 0,
        })
    }

    async fn record(&mut self, kind: &str, payload: serde_json::Value) -> StorageResult<u64> {
        let seq = self.seq + 1;
        let event = RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.run_id, event).await?;
        self.seq = seq;
        Ok(seq)
    }

    pub async fn stage_started(&mut self, stage: StageKind, command: &[String]) -> StorageResult<()> {
        let seq = self
            .record(STAGE_STARTED, json!({ "stage": stage, "command": command }))
            .await?;
        obs::emit_stage_started(&self.run_id.to_string(), stage.name(), seq);
        Ok(())
    }

    pub async fn stage_succeeded(
        &mut self,
        stage: StageKind,
        exit_code: Option<i32>,
        duration_ms: u64,
    ) -> StorageResult<()> {
        self.record(
            STAGE_SUCCEEDED,
            json!({ "stage": stage, "exit_code": exit_code, "duration_ms": duration_ms }),
        )
        .await?;
        obs::emit_stage_succeeded(&self.run_id.to_string(), stage.name(), duration_ms);
        Ok(())
    }

    pub async fn stage_failed(
        &mut self,
        stage: StageKind,
        error: &StageError,
        duration_ms: u64,
    ) -> StorageResult<()> {
        let diagnostics = error.diagnostics();
        self.record(
            STAGE_FAILED,
            json!({
                "stage": stage,
                "error": error.to_string(),
                "aborted": error.is_aborted(),
                "exit_code": diagnostics.map(|d| d.exit_code),
                "output_tail": diagnostics.map(|d| d.output_tail.clone()).unwrap_or_default(),
                "duration_ms": duration_ms,
            }),
        )
        .await?;
        obs::emit_stage_failed(&self.run_id.to_string(), stage.name(), error);
        Ok(())
    }

    /// Finalize the ledger run according to the Run's terminal outcome.
    pub async fn finish(self, run: &Run, duration_ms: u64) -> StorageResult<()> {
        let outcome = run.outcome();
        let summary = RunSummary {
            total_events: self.seq,
            duration_ms,
            success: outcome == RunOutcome::Success,
            failed_stage: run.failure().map(|f| f.stage.name().to_string()),
        };
        let run_id = self.run_id.to_string();
        obs::emit_run_finished(&run_id, &format!("{outcome:?}"), duration_ms, self.seq);

        match outcome {
            RunOutcome::Success => self.ledger.complete_run(&self.run_id, summary).await,
            RunOutcome::Aborted => self.ledger.cancel_run(&self.run_id, summary).await,
            RunOutcome::Failed | RunOutcome::Pending => {
                self.ledger.fail_run(&self.run_id, summary).await
            }
        }
    }
}
