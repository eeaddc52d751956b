//! Orchestrator entry
//!
//! Wires the subsystems, seeds the state from the cold-stage handoff,
//! drives the machine one tick at a time, and persists a snapshot after
//! every tick so a run can be inspected post-mortem.

use crate::analyzer::ErrorAnalyzer;
use crate::context::ContextAssembler;
use crate::llm::{LanguageModel, Retrieval};
use crate::machine::{RepairStateMachine, Termination};
use crate::model::{Budget, CommandRecord, LoopState, Maturity, TestCatalog};
use crate::planner::TestPlanner;
use crate::script::{self, ScriptStore};
use crate::verify::VerificationExecutor;
use crate::Result;
use chrono::Utc;
use envloop_adapter::{ContainerAdapter, FileEntry};
use envloop_config::RunConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub termination: Termination,
    pub exit_code: i32,
    pub run_id: String,
    pub ticks: u64,
    pub maturity: Maturity,
    pub final_installer: CommandRecord,
    pub last_analysis: String,
    /// Failing commands in execution order, with exit codes.
    pub failing_commands: Vec<(String, i64)>,
    pub snapshot_path: PathBuf,
}

impl RunReport {
    /// Concise terminal report for non-success outcomes and logs.
    pub fn render(&self) -> String {
        let verdict = match self.termination {
            Termination::Success => "success",
            Termination::Exhausted => "budget exhausted",
            Termination::Cancelled => "cancelled",
        };
        let mut out = format!(
            "envloop finished: {} (exit {})\n\
             run {} | {} tick(s) | maturity {}\n\
             installer: {}\n",
            verdict, self.exit_code, self.run_id, self.ticks, self.maturity,
            self.final_installer.invocation,
        );
        if !self.last_analysis.is_empty() {
            out.push_str(&format!("last analysis: {}\n", self.last_analysis));
        }
        if !self.failing_commands.is_empty() {
            out.push_str("failing commands:\n");
            for (command, exit_code) in &self.failing_commands {
                out.push_str(&format!("  - {} (exit {})\n", command, exit_code));
            }
        }
        out.push_str(&format!("state snapshot: {}\n", self.snapshot_path.display()));
        out
    }
}

pub struct Orchestrator {
    machine: RepairStateMachine,
    adapter: Arc<dyn ContainerAdapter>,
    script_store: ScriptStore,
    config: RunConfig,
    snapshot_path: PathBuf,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wire the subsystems. The verification mode and patch strategy are
    /// fixed here and never switch mid-run.
    pub fn new(
        adapter: Arc<dyn ContainerAdapter>,
        llm: Arc<dyn LanguageModel>,
        retrieval: Option<Arc<dyn Retrieval>>,
        config: RunConfig,
        project_dir: &Path,
    ) -> Self {
        let assembler =
            ContextAssembler::new(config.history_window, config.stdout_truncate_chars);
        let analyzer = ErrorAnalyzer::new(llm.clone(), assembler.clone(), config.patch_strategy);
        let planner = TestPlanner::new(llm, retrieval, assembler);
        let executor = VerificationExecutor::new(config.mode, adapter.clone(), config.timeout);
        let script_store = ScriptStore::new(project_dir);
        let stop = Arc::new(AtomicBool::new(false));
        let snapshot_path =
            project_dir.join(format!("state_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));

        let machine = RepairStateMachine::new(
            adapter.clone(),
            analyzer,
            planner,
            executor,
            script_store.clone(),
            config.clone(),
            stop.clone(),
        );

        Self {
            machine,
            adapter,
            script_store,
            config,
            snapshot_path,
            stop,
        }
    }

    /// Shared flag an external signal handler may set to cancel the run.
    /// The in-flight exec finishes (bounded by its timeout) before the
    /// machine exits.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Build the image (when a Dockerfile is provided) and start the
    /// container.
    pub async fn prepare(&self, dockerfile: Option<&str>) -> Result<()> {
        if let Some(dockerfile) = dockerfile {
            self.adapter.build_image(dockerfile).await?;
        }
        self.adapter.start(self.config.bind_mount).await?;
        Ok(())
    }

    /// Run the repair loop to termination.
    pub async fn run(
        &self,
        installer: CommandRecord,
        catalog: TestCatalog,
    ) -> Result<RunReport> {
        self.seed_installer(&installer).await?;

        let catalog = self.machine.planner.normalize(&catalog).await?;
        tracing::info!(
            "Catalog normalized: {} command(s) across {} bucket(s)",
            catalog.len(),
            TestCatalog::LEVELS
                .iter()
                .filter(|l| !catalog.bucket(**l).is_empty())
                .count()
        );

        let mut state = LoopState::new(
            installer,
            catalog,
            Budget::from_config(&self.config.budget),
        );

        let termination = loop {
            let outcome = self.machine.tick(&mut state).await;
            self.persist(&state)?;
            match outcome {
                Ok(Some(termination)) => break termination,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Tick {} aborted: {}", state.tick, e);
                    return Err(e);
                }
            }
        };

        let report = self.report(&state, termination);
        tracing::info!("\n{}", report.render());
        Ok(report)
    }

    /// Mirror the initial installer script to the host store and the
    /// container before the first execution.
    async fn seed_installer(&self, installer: &CommandRecord) -> Result<()> {
        let Some(body) = &installer.file_content else {
            return Ok(());
        };
        let relative = script::relative_path_from_invocation(
            &installer.invocation,
            self.adapter.workdir(),
        )
        .unwrap_or_else(|| "envloop_setup.sh".to_string());
        self.script_store.save(&relative, body)?;
        self.adapter
            .put_files(&[FileEntry::text(relative, body)])
            .await?;
        Ok(())
    }

    /// Write the snapshot, keyed by the tick counter inside it, with
    /// stdout trimmed to the same budget the analyzer saw.
    fn persist(&self, state: &LoopState) -> Result<()> {
        let snapshot = state.truncated(self.config.stdout_truncate_chars);
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.snapshot_path, json)?;
        Ok(())
    }

    fn report(&self, state: &LoopState, termination: Termination) -> RunReport {
        let failing_commands = state
            .installer_history
            .iter()
            .chain(state.test_history.iter())
            .filter(|entry| !entry.ok)
            .map(|entry| (entry.command.invocation.clone(), entry.result.exit_code))
            .collect();

        RunReport {
            termination,
            exit_code: termination.exit_code(),
            run_id: state.run_id.clone(),
            ticks: state.tick,
            maturity: state.maturity(),
            final_installer: state.current_installer.clone(),
            last_analysis: state.error_analysis.clone(),
            failing_commands,
            snapshot_path: self.snapshot_path.clone(),
        }
    }
}
