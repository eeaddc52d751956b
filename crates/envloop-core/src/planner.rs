//! Verification command curation and selection
//!
//! Funnel defense: smoke first to fail fast, entry second to succeed fast,
//! then integration, then unit as a diagnostic of last resort. Selection
//! is LLM-assisted but the build-first gate and the repeated-failure
//! switch are enforced here regardless of what the collaborator returns.

use crate::context::{command_stats, CommandStats, ContextAssembler};
use crate::llm::{LanguageModel, Retrieval, TestSelection};
use crate::model::{ExecutionStep, LoopState, Maturity, TestCatalog, TestLevel};
use crate::{CoreError, Result};
use std::sync::Arc;

/// A command that has failed this many times yields to a less-failed peer
/// in the same level.
const FAILURE_SWITCH_THRESHOLD: u32 = 5;

pub struct TestPlanner {
    llm: Arc<dyn LanguageModel>,
    retrieval: Option<Arc<dyn Retrieval>>,
    assembler: ContextAssembler,
}

impl TestPlanner {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        retrieval: Option<Arc<dyn Retrieval>>,
        assembler: ContextAssembler,
    ) -> Self {
        Self {
            llm,
            retrieval,
            assembler,
        }
    }

    /// One-time catalog cleanup: local prefilter, then an LLM re-bucketing
    /// pass with optional advisory search. Falls back to the prefiltered
    /// catalog when the collaborator returns nothing usable.
    pub async fn normalize(&self, catalog: &TestCatalog) -> Result<TestCatalog> {
        let prefiltered = catalog.prefilter();
        if prefiltered.is_empty() {
            return Ok(prefiltered);
        }

        let advisory = match &self.retrieval {
            Some(retrieval) => {
                let query = format!(
                    "how to build and test a project with commands like: {}",
                    prefiltered
                        .build
                        .iter()
                        .chain(prefiltered.level4.iter())
                        .take(3)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                match retrieval.search(&query).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        // advisory only
                        tracing::warn!("Retrieval search failed, continuing without it: {}", e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let prompt = self.assembler.normalization_prompt(&prefiltered, &advisory);
        let normalized = self.llm.normalize_catalog(&prompt).await?;
        tracing::debug!("Catalog normalization reasoning: {}", normalized.reasoning);

        let cleaned = normalized.catalog.prefilter();
        if cleaned.is_empty() {
            tracing::warn!("Normalization dropped every command, keeping the prefiltered catalog");
            return Ok(prefiltered);
        }
        Ok(cleaned)
    }

    /// Deterministic funnel-defense ordering over the whole catalog.
    /// Build commands lead as a blocking pre-phase, then smoke (blocking),
    /// entry (stop on success), integration, unit.
    pub fn sequence(&self, catalog: &TestCatalog) -> Vec<ExecutionStep> {
        const ORDER: [TestLevel; 5] = [
            TestLevel::Build,
            TestLevel::Smoke,
            TestLevel::Entry,
            TestLevel::Integration,
            TestLevel::Unit,
        ];

        let deduped = catalog.prefilter();
        let mut steps = Vec::new();
        let mut order = 1u32;
        for level in ORDER {
            for command in deduped.bucket(level) {
                steps.push(ExecutionStep {
                    order,
                    command: command.clone(),
                    level,
                    phase: level.phase(),
                    stop_on_success: level == TestLevel::Entry,
                    is_blocking: matches!(level, TestLevel::Build | TestLevel::Smoke),
                });
                order += 1;
            }
        }
        steps
    }

    /// Choose the next command to run. Returns the selection and the
    /// maturity tier it was made at.
    pub async fn select(&self, state: &LoopState) -> Result<(TestSelection, Maturity)> {
        if state.test_catalog.build.is_empty() {
            return Err(CoreError::InvariantViolation(
                "cannot select a test before the catalog has build commands".to_string(),
            ));
        }

        let maturity = state.maturity();
        let prompt = self.assembler.selection_prompt(state);
        let mut selection = self.llm.select_test(&prompt).await?;
        tracing::debug!("Selection reasoning: {}", selection.reasoning);

        let stats = command_stats(&state.test_history);

        // Build-first gate: hard invariant, not just a prompt rule.
        if maturity == Maturity::Unknown && selection.level != TestLevel::Build {
            let fallback = best_candidate(&state.test_catalog, TestLevel::Build, &stats)
                .ok_or_else(|| {
                    CoreError::InvariantViolation(
                        "build bucket empty while enforcing build-first selection".to_string(),
                    )
                })?;
            tracing::warn!(
                "Collaborator selected {} before a build passed; overriding with {}",
                selection.command,
                fallback
            );
            selection = TestSelection {
                command: fallback,
                level: TestLevel::Build,
                reasoning: format!(
                    "build-first override (was: {})",
                    selection.reasoning
                ),
            };
        }

        // Repeated-failure exception: after enough failures, switch to a
        // same-level peer that has failed less.
        if let Some(current) = stats.iter().find(|s| {
            s.command == selection.command && s.level == Some(selection.level)
        }) {
            if current.failed >= FAILURE_SWITCH_THRESHOLD {
                if let Some(peer) =
                    less_failed_peer(&state.test_catalog, selection.level, current, &stats)
                {
                    tracing::info!(
                        "{} has failed {} times, switching to peer {}",
                        selection.command,
                        current.failed,
                        peer
                    );
                    selection.command = peer;
                }
            }
        }

        Ok((selection, maturity))
    }
}

/// Pick the best command from a bucket: fewest failures, then catalog
/// order. Commands never executed count as zero failures.
fn best_candidate(
    catalog: &TestCatalog,
    level: TestLevel,
    stats: &[CommandStats],
) -> Option<String> {
    catalog
        .bucket(level)
        .iter()
        .min_by_key(|cmd| {
            stats
                .iter()
                .find(|s| s.command == **cmd && s.level == Some(level))
                .map(|s| s.failed)
                .unwrap_or(0)
        })
        .cloned()
}

/// A same-level alternative with strictly fewer failures than `current`.
fn less_failed_peer(
    catalog: &TestCatalog,
    level: TestLevel,
    current: &CommandStats,
    stats: &[CommandStats],
) -> Option<String> {
    catalog
        .bucket(level)
        .iter()
        .filter(|cmd| **cmd != current.command)
        .map(|cmd| {
            let failed = stats
                .iter()
                .find(|s| s.command == *cmd && s.level == Some(level))
                .map(|s| s.failed)
                .unwrap_or(0);
            (cmd.clone(), failed)
        })
        .filter(|(_, failed)| *failed < current.failed)
        .min_by_key(|(_, failed)| *failed)
        .map(|(cmd, _)| cmd)
}
