//! Failure analysis and patch generation
//!
//! Wraps the LLM collaborator with the guarantees the loop depends on:
//! the patch matches the configured shape, a recurring error never gets an
//! equivalent patch twice, and shared-library errors are never answered
//! with a language-package install.

use crate::context::ContextAssembler;
use crate::llm::{Analysis, LanguageModel, Patch};
use crate::model::LoopState;
use crate::{CoreError, Result};
use envloop_config::PatchStrategy;
use std::collections::HashSet;
use std::sync::Arc;

/// Attempts before giving up on a collaborator that keeps repeating
/// itself or violating the library policy.
const MAX_RETRIES: usize = 3;

/// Two rewrite bodies with at least this much trigram overlap count as
/// equivalent.
const REWRITE_EQUIVALENCE: f64 = 0.90;

const SHARED_OBJECT_MARKER: &str = "cannot open shared object file";

/// Produces an analysis plus a patch for the current failing round.
pub struct ErrorAnalyzer {
    llm: Arc<dyn LanguageModel>,
    assembler: ContextAssembler,
    strategy: PatchStrategy,
    /// Patches this instance already emitted. History reflection must hold
    /// even when the caller's state has not changed between calls.
    emitted: std::sync::Mutex<Vec<String>>,
}

impl ErrorAnalyzer {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        assembler: ContextAssembler,
        strategy: PatchStrategy,
    ) -> Self {
        Self {
            llm,
            assembler,
            strategy,
            emitted: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn strategy(&self) -> PatchStrategy {
        self.strategy
    }

    /// Analyze the failing round against the trailing history and return
    /// a patch that diverges from prior attempts.
    pub async fn analyze(&self, state: &LoopState, script_path: &str) -> Result<Analysis> {
        let base_prompt = match self.strategy {
            PatchStrategy::RewriteFull => self.assembler.rewrite_prompt(state, script_path),
            PatchStrategy::SingleCommand => self.assembler.single_command_prompt(state),
        };
        let prior = self.prior_patches(state);

        let mut prompt = base_prompt.clone();
        for attempt in 0..MAX_RETRIES {
            let analysis = self.llm.analyze_and_patch(&prompt, self.strategy).await?;

            if !analysis.patch.matches_strategy(self.strategy) {
                return Err(CoreError::Llm(format!(
                    "analyzer returned a patch of the wrong shape for strategy {}",
                    self.strategy
                )));
            }

            if self.violates_library_policy(state, &analysis.patch) {
                tracing::warn!(
                    "Analyzer answered a shared-library error with a language package, retrying"
                );
                prompt = format!("{}{}", base_prompt, ContextAssembler::shared_library_note());
                continue;
            }

            if is_equivalent_to_any(&analysis.patch, &prior) {
                tracing::warn!(
                    "Analyzer repeated an equivalent patch (attempt {}), requesting divergence",
                    attempt + 1
                );
                prompt = format!("{}{}", base_prompt, ContextAssembler::divergence_note(&prior));
                continue;
            }

            self.emitted
                .lock()
                .expect("emitted lock poisoned")
                .push(patch_text(&analysis.patch));
            return Ok(analysis);
        }

        Err(CoreError::Llm(
            "analyzer kept repeating an equivalent patch for a recurring error".to_string(),
        ))
    }

    /// Patch texts already tried: the history window plus everything this
    /// instance emitted itself.
    fn prior_patches(&self, state: &LoopState) -> Vec<String> {
        let window = self.assembler.history_window;
        let history = &state.installer_history;
        let start = history.len().saturating_sub(window);
        let mut prior: Vec<String> = history[start..]
            .iter()
            .map(|entry| match self.strategy {
                PatchStrategy::SingleCommand => entry.command.invocation.clone(),
                PatchStrategy::RewriteFull => entry
                    .command
                    .file_content
                    .clone()
                    .unwrap_or_else(|| entry.command.invocation.clone()),
            })
            .collect();
        prior.extend(self.emitted.lock().expect("emitted lock poisoned").iter().cloned());
        prior
    }

    /// A shared-library failure answered with a language-package install.
    fn violates_library_policy(&self, state: &LoopState, patch: &Patch) -> bool {
        let failing_output = state
            .last_installer_result
            .as_ref()
            .map(|r| format!("{}\n{}", r.stdout, r.stderr))
            .unwrap_or_default();
        if !failing_output.contains(SHARED_OBJECT_MARKER) {
            return false;
        }
        let Patch::SingleCommand { text } = patch else {
            // rewrite bodies legitimately contain language installs for
            // other dependencies; the prompt rules govern them
            return false;
        };
        is_language_package_install(text) && !is_system_package_install(text)
    }
}

fn is_language_package_install(command: &str) -> bool {
    const LANGUAGE_MANAGERS: [&str; 7] = [
        "pip install",
        "pip3 install",
        "-m pip install",
        "npm install",
        "yarn add",
        "gem install",
        "cargo install",
    ];
    LANGUAGE_MANAGERS.iter().any(|m| command.contains(m))
}

fn is_system_package_install(command: &str) -> bool {
    const SYSTEM_MANAGERS: [&str; 4] = ["apt-get", "apt ", "yum ", "apk "];
    SYSTEM_MANAGERS.iter().any(|m| command.contains(m))
}

fn patch_text(patch: &Patch) -> String {
    match patch {
        Patch::SingleCommand { text } => text.clone(),
        Patch::Rewrite { body } => body.clone(),
    }
}

/// Patch equivalence: string equality for single commands, trigram overlap
/// of at least 90% for rewrite bodies.
fn is_equivalent_to_any(patch: &Patch, prior: &[String]) -> bool {
    match patch {
        Patch::SingleCommand { text } => prior.iter().any(|p| p.trim() == text.trim()),
        Patch::Rewrite { body } => prior
            .iter()
            .any(|p| trigram_similarity(p, body) >= REWRITE_EQUIVALENCE),
    }
}

/// Jaccard similarity over character trigrams.
fn trigram_similarity(a: &str, b: &str) -> f64 {
    let grams = |s: &str| -> HashSet<[char; 3]> {
        let chars: Vec<char> = s.chars().collect();
        chars.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
    };
    let (ga, gb) = (grams(a), grams(b));
    if ga.is_empty() && gb.is_empty() {
        return 1.0;
    }
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let intersection = ga.intersection(&gb).count() as f64;
    let union = ga.union(&gb).count() as f64;
    intersection / union
}
