//! The repair state machine
//!
//! Drives execute → check → analyze → patch → re-execute cycles. One tick
//! per router entry; the orchestrator owns the loop and persists a
//! snapshot after every tick, so two ticks never overlap.

use crate::analyzer::ErrorAnalyzer;
use crate::llm::Patch;
use crate::model::{CommandRecord, LoopState, RoundTag};
use crate::planner::TestPlanner;
use crate::script::{self, ScriptStore};
use crate::verify::VerificationExecutor;
use crate::{CoreError, Result};
use envloop_adapter::{ContainerAdapter, FileEntry};
use envloop_config::RunConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Script name used when a rewrite arrives for an installer that was a
/// bare command rather than a script file.
const DEFAULT_SCRIPT_NAME: &str = "envloop_setup.sh";

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Exhausted,
    Cancelled,
}

impl Termination {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Exhausted => 2,
            Self::Cancelled => 4,
        }
    }
}

/// Where the router sends a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    ExecuteScript,
    GenerateRewrite,
    SelectTest,
    ExecuteTest,
    Terminate(Termination),
}

pub struct RepairStateMachine {
    adapter: Arc<dyn ContainerAdapter>,
    analyzer: ErrorAnalyzer,
    pub(crate) planner: TestPlanner,
    executor: VerificationExecutor,
    script_store: ScriptStore,
    config: RunConfig,
    stop: Arc<AtomicBool>,
}

impl RepairStateMachine {
    pub fn new(
        adapter: Arc<dyn ContainerAdapter>,
        analyzer: ErrorAnalyzer,
        planner: TestPlanner,
        executor: VerificationExecutor,
        script_store: ScriptStore,
        config: RunConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            adapter,
            analyzer,
            planner,
            executor,
            script_store,
            config,
            stop,
        }
    }

    /// The routing table. Pure: decided solely from flags, budgets, and
    /// which results exist.
    pub fn route(state: &LoopState) -> Node {
        if state.check.installer_ok && state.check.test_ok {
            return Node::Terminate(Termination::Success);
        }
        if state.budget.exhausted().is_some() {
            return Node::Terminate(Termination::Exhausted);
        }
        if state.last_installer_result.is_none() {
            return Node::ExecuteScript;
        }
        if !state.check.installer_ok {
            return Node::GenerateRewrite;
        }
        if state.selected_test.is_none() {
            return Node::SelectTest;
        }
        if state.last_test_result.is_none() {
            return Node::ExecuteTest;
        }
        // installer ok, test ran and failed
        Node::GenerateRewrite
    }

    /// Advance one tick. Returns `Some(termination)` when the loop is
    /// done, `None` to keep going. The caller snapshots state after every
    /// call regardless.
    pub async fn tick(&self, state: &mut LoopState) -> Result<Option<Termination>> {
        if self.stop.load(Ordering::Relaxed) {
            tracing::info!("Stop signal received, cancelling");
            return Ok(Some(Termination::Cancelled));
        }

        state.tick += 1;
        state.budget.take_tick();

        let node = Self::route(state);
        tracing::debug!("Tick {} routed to {:?}", state.tick, node);

        match node {
            Node::Terminate(termination) => {
                if termination == Termination::Exhausted {
                    if let Some(which) = state.budget.exhausted() {
                        tracing::info!("Budget {} exhausted", which);
                    }
                }
                return Ok(Some(termination));
            }
            Node::ExecuteScript => self.execute_script(state).await?,
            Node::GenerateRewrite => self.generate_rewrite(state).await?,
            Node::SelectTest => self.select_test(state).await?,
            Node::ExecuteTest => self.execute_test(state).await?,
        }

        // CheckStatus: refresh the flags from the latest results, then
        // hand control back to the router on the next tick.
        state.refresh_check();
        state.validate()?;
        Ok(None)
    }

    async fn execute_script(&self, state: &mut LoopState) -> Result<()> {
        let invocation = state.current_installer.invocation.clone();
        tracing::info!("Executing installer: {}", invocation);
        let result = self
            .adapter
            .exec(&invocation, self.config.timeout.test_secs)
            .await?;
        tracing::info!("Installer exited with code {}", result.exit_code);
        state.record_installer_round(result);
        Ok(())
    }

    async fn generate_rewrite(&self, state: &mut LoopState) -> Result<()> {
        let failing_tag = if !state.check.installer_ok {
            RoundTag::Installer
        } else {
            RoundTag::Test
        };

        let script_rel = script::relative_path_from_invocation(
            &state.current_installer.invocation,
            self.adapter.workdir(),
        )
        .unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string());

        // An LLM failure aborts the tick and is retried once; a second
        // consecutive failure costs a rewrite round.
        let analysis = match self.analyzer.analyze(state, &script_rel).await {
            Ok(analysis) => analysis,
            Err(CoreError::Llm(first)) => {
                tracing::warn!("Analyzer call failed ({}), retrying once", first);
                match self.analyzer.analyze(state, &script_rel).await {
                    Ok(analysis) => analysis,
                    Err(CoreError::Llm(second)) => {
                        tracing::error!("Analyzer failed twice: {}", second);
                        state.budget.take_rewrite();
                        state.error_analysis =
                            format!("analyzer failed twice in one tick: {}", second);
                        return Ok(());
                    }
                    Err(other) => return Err(other),
                }
            }
            Err(other) => return Err(other),
        };

        state.budget.take_rewrite();
        state.attach_analysis(failing_tag, &analysis.analysis);

        match analysis.patch {
            Patch::Rewrite { body } => {
                let written_rel = self.script_store.save(&script_rel, &body)?;
                self.adapter
                    .put_files(&[FileEntry::text(written_rel.clone(), &body)])
                    .await?;
                let invocation = format!(
                    "bash {}/{}",
                    self.adapter.workdir().trim_end_matches('/'),
                    written_rel
                );
                tracing::info!("Installer rewritten, {} bytes", body.len());
                state.replace_installer(CommandRecord::script(invocation, body));
            }
            Patch::SingleCommand { text } => {
                tracing::info!("Repair command: {}", text);
                state.replace_installer(CommandRecord::one_liner(text));
            }
        }

        // a failed verification is retried once the environment changes
        if failing_tag == RoundTag::Test {
            state.last_test_result = None;
        }
        Ok(())
    }

    async fn select_test(&self, state: &mut LoopState) -> Result<()> {
        let (selection, maturity) = match self.planner.select(state).await {
            Ok(outcome) => outcome,
            Err(CoreError::Llm(first)) => {
                tracing::warn!("Selection call failed ({}), retrying once", first);
                match self.planner.select(state).await {
                    Ok(outcome) => outcome,
                    Err(CoreError::Llm(second)) => {
                        tracing::error!("Selection failed twice: {}", second);
                        state.budget.take_rewrite();
                        return Ok(());
                    }
                    Err(other) => return Err(other),
                }
            }
            Err(other) => return Err(other),
        };

        tracing::info!(
            "Selected {} command at maturity {}: {}",
            selection.level,
            maturity,
            selection.command
        );
        state.select_test(selection.command, selection.level);
        Ok(())
    }

    async fn execute_test(&self, state: &mut LoopState) -> Result<()> {
        let command = state.selected_test.clone().ok_or_else(|| {
            CoreError::InvariantViolation("ExecuteTest entered with no selected test".to_string())
        })?;

        state.budget.take_test();
        let (raw, outcome) = self.executor.run(&command).await?;
        let passed = outcome.ok();
        let level = state.selected_test_level;
        state.record_test_round(command, level, raw, outcome);

        // Build is a pre-phase: a passing build advances maturity but is
        // not the verification target, so selection continues.
        if passed && level == Some(crate::model::TestLevel::Build) {
            state.selected_test = None;
            state.selected_test_level = None;
            state.last_test_result = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Budget, TestCatalog, TestLevel, TestResult};
    use envloop_adapter::ExecResult;

    fn base_state() -> LoopState {
        LoopState::new(
            CommandRecord::script("bash /app/envloop_setup.sh", "#!/bin/bash\n"),
            TestCatalog {
                build: vec!["make".into()],
                level1: vec!["./server".into()],
                ..Default::default()
            },
            Budget::from_config(&Default::default()),
        )
    }

    fn pass(state: &mut LoopState) {
        state.record_installer_round(ExecResult::new(0, "", ""));
        state.refresh_check();
    }

    #[test]
    fn test_route_first_tick_executes_script() {
        let state = base_state();
        assert_eq!(RepairStateMachine::route(&state), Node::ExecuteScript);
    }

    #[test]
    fn test_route_failed_installer_goes_to_rewrite() {
        let mut state = base_state();
        state.record_installer_round(ExecResult::new(1, "err", ""));
        state.refresh_check();
        assert_eq!(RepairStateMachine::route(&state), Node::GenerateRewrite);
    }

    #[test]
    fn test_route_installer_ok_selects_test() {
        let mut state = base_state();
        pass(&mut state);
        assert_eq!(RepairStateMachine::route(&state), Node::SelectTest);
    }

    #[test]
    fn test_route_selected_but_unrun_test_executes() {
        let mut state = base_state();
        pass(&mut state);
        state.select_test("make".into(), TestLevel::Build);
        assert_eq!(RepairStateMachine::route(&state), Node::ExecuteTest);
    }

    #[test]
    fn test_route_failed_test_goes_to_rewrite() {
        let mut state = base_state();
        pass(&mut state);
        state.select_test("make".into(), TestLevel::Build);
        state.record_test_round(
            "make".into(),
            Some(TestLevel::Build),
            ExecResult::new(2, "", ""),
            TestResult::Exec(ExecResult::new(2, "", "")),
        );
        state.refresh_check();
        assert_eq!(RepairStateMachine::route(&state), Node::GenerateRewrite);
    }

    #[test]
    fn test_route_both_ok_is_success() {
        let mut state = base_state();
        pass(&mut state);
        state.select_test("make".into(), TestLevel::Build);
        state.record_test_round(
            "make".into(),
            Some(TestLevel::Build),
            ExecResult::new(0, "", ""),
            TestResult::Exec(ExecResult::new(0, "", "")),
        );
        state.refresh_check();
        assert_eq!(
            RepairStateMachine::route(&state),
            Node::Terminate(Termination::Success)
        );
    }

    #[test]
    fn test_route_exhausted_budget_terminates() {
        let mut state = base_state();
        state.budget.rewrite_rounds_left = 0;
        assert_eq!(
            RepairStateMachine::route(&state),
            Node::Terminate(Termination::Exhausted)
        );
    }

    #[test]
    fn test_route_success_wins_over_exhaustion() {
        let mut state = base_state();
        pass(&mut state);
        state.record_test_round(
            "make".into(),
            Some(TestLevel::Build),
            ExecResult::new(0, "", ""),
            TestResult::Exec(ExecResult::new(0, "", "")),
        );
        state.refresh_check();
        state.budget.global_ticks_left = 0;
        assert_eq!(
            RepairStateMachine::route(&state),
            Node::Terminate(Termination::Success)
        );
    }

    #[test]
    fn test_termination_exit_codes() {
        assert_eq!(Termination::Success.exit_code(), 0);
        assert_eq!(Termination::Exhausted.exit_code(), 2);
        assert_eq!(Termination::Cancelled.exit_code(), 4);
    }
}
