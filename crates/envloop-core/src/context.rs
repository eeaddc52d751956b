//! Prompt assembly for the LLM collaborator
//!
//! The rule texts here are part of the loop's contract: the level
//! definitions, the funnel-defense ordering, the missing-library policy,
//! and the history-reflection requirement all have matching enforcement in
//! the planner and analyzer. Keep them in sync.

use crate::model::{tail_chars, LoopState, RoundEntry, TestCatalog, TestLevel};
use std::collections::BTreeMap;

/// Error-classification and output rules shared by both patch shapes.
const ANALYSIS_RULES: &str = "\
Part 1: Error Analysis (ONLY)
1. Carefully analyze the error information in the latest setup output.
2. If verification output is provided, analyze the failures and their root causes.
3. Identify root causes (module not found, command does not exist, missing shared \
libraries, version conflicts, etc.).
4. Do NOT propose fixes in this part; only explain the causes.

Classification rules:
- If the error message contains \"cannot open shared object file\" (e.g. libEGL.so.1), \
the fix MUST install the system package through the detected OS package manager \
(apt-get/yum/apk), NEVER a language package manager.
- If the error is ModuleNotFoundError, the fix MUST target the exact interpreter that \
runs the verification (explicit interpreter path such as /app/.venv/bin/python -m pip), \
not a bare pip.
- All package installations MUST use non-interactive flags (-y/--yes).
- Commands run as root in a container: no sudo, no interactive prompts.

History reflection:
- The prior rounds below include your own previous analyses. If the same error \
repeats, you MUST change strategy rather than repeat an equivalent fix: try a \
different package manager, a system package instead of a language package, an \
explicit interpreter path instead of environment activation, or a different \
package name.";

/// Rewrite-shape rules (script format post-conditions).
const REWRITE_RULES: &str = "\
Part 2: Generate a complete new bash script
The new script must:
- Start with #!/bin/bash and use set -e to stop on the first error.
- Emit log messages (log/error/warning helper functions are fine).
- Organize logic into functions with a main entry point.
- Be idempotent: safe to run repeatedly without breaking the environment.
- Address every cause identified in Part 1.
Your script is written to disk verbatim and re-executed as-is; output the complete \
file content, not a diff.";

/// Single-command-shape rules.
const SINGLE_COMMAND_RULES: &str = "\
Part 2: Generate a single repair command
- Output ONE short shell command that addresses the root cause from Part 1.
- Chain with && only when strictly necessary; prefer the simplest command.
- The command must be non-interactive and idempotent.";

/// Selection rules: maturity tiers and the build-first gate.
const SELECTION_RULES: &str = "\
Environment maturity tiers (ascending):
1. Unknown: no build command has passed.
2. Installable: a build command passed, nothing else.
3. Testable: build passed, and a smoke (level3) or unit (level4) command passed.
4. Runnable: build passed, and an entry (level1) or integration (level2) command \
passed. This is the success target.

Selection strategy:
- CRITICAL: until at least one build command has PASSED you MUST select from the \
build commands. Never pick level1-level4 before that.
- After build passes, pick the command MOST NECESSARY for reaching the next tier, \
even if it has failed before; the environment is repaired between attempts.
- Prefer commands not yet executed; among executed ones prefer the fewest failures.
- Only when a command has failed five or more times AND a same-level peer has failed \
fewer times may you switch to the peer.
- Select exactly ONE command.";

/// Normalization rules: funnel-defense levels and conservative filtering.
const NORMALIZE_RULES: &str = "\
Classify each command into exactly one bucket:
- build: compiles or installs the project itself (mvn compile, npm run build, cargo build).
- level1 (entry): starts the software (python main.py, npm start, ./target/release/app).
- level2 (integration): tests against real dependencies (pytest --integration, npm run test:e2e).
- level3 (smoke): minimal invocations (tool --version, make check).
- level4 (unit): fine-grained tests (pytest -q, go test).

Filtering must be conservative: drop only empty entries, pure comments, and obvious \
placeholders. When unsure, classify rather than drop. Deduplicate; a command \
appearing in several buckets belongs in the single most appropriate one. Any search \
snippets provided are advisory only.";

/// Builds the textual inputs handed to the LLM collaborator.
///
/// The sole reader of the history arrays; windowing and truncation for
/// prompt budgets happen here, never at record time.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    /// Prior rounds shown per stream.
    pub history_window: usize,
    /// Tail budget (chars) for the current round's stdout.
    pub stdout_budget: usize,
}

impl ContextAssembler {
    pub fn new(history_window: usize, stdout_budget: usize) -> Self {
        Self {
            history_window,
            stdout_budget,
        }
    }

    /// Older rounds get half the current round's budget.
    fn older_budget(&self) -> usize {
        (self.stdout_budget / 2).max(1)
    }

    /// The failing-round context shared by both patch shapes.
    fn failure_context(&self, state: &LoopState) -> String {
        let installer_text = state
            .current_installer
            .file_content
            .as_deref()
            .unwrap_or(&state.current_installer.invocation);

        let latest_output = state
            .last_installer_result
            .as_ref()
            .map(|r| tail_chars(&r.stdout, self.stdout_budget))
            .unwrap_or_default();

        let mut context = format!(
            "<context>\nENV SETUP COMMAND:\n```\n{}\n```\n\n\
             ENV SETUP OUTPUT (latest):\n```\n{}\n```\n\n\
             VERIFICATION COMMAND:\n```\n{}\n```\n",
            installer_text,
            latest_output,
            state.selected_test.as_deref().unwrap_or("(not selected yet)"),
        );

        if let Some(result) = &state.last_test_result {
            let rendered = match result {
                crate::model::TestResult::Exec(r) => format!(
                    "Exit code: {}\nOutput tail:\n{}",
                    r.exit_code,
                    tail_chars(&r.stdout, self.stdout_budget)
                ),
                crate::model::TestResult::Collection {
                    exit_code,
                    issues,
                    total_errors,
                    ..
                } => {
                    let mut text = format!(
                        "Exit code: {}\nFound {} error(s) during test collection.\n",
                        exit_code,
                        total_errors.unwrap_or(issues.len())
                    );
                    for issue in issues {
                        text.push_str(&format!(
                            "- {}: {} ({})\n",
                            issue.file, issue.error_kind, issue.message
                        ));
                    }
                    text
                }
            };
            context.push_str(&format!(
                "\nVERIFICATION OUTPUT (current):\n```\n{}\n```\n",
                rendered
            ));
        }

        context.push_str(&self.rounds_section(
            "PREVIOUS SETUP ROUNDS",
            &state.installer_history,
            true,
        ));
        context.push_str(&self.rounds_section(
            "PREVIOUS VERIFICATION ROUNDS",
            &state.test_history,
            false,
        ));
        context.push_str("</context>\n");
        context
    }

    /// Render the trailing window of a history, excluding the live round
    /// when `skip_last` (the current failure is already shown above).
    fn rounds_section(&self, title: &str, history: &[RoundEntry], skip_last: bool) -> String {
        let end = if skip_last {
            history.len().saturating_sub(1)
        } else {
            history.len()
        };
        let start = end.saturating_sub(self.history_window);
        if start >= end {
            return String::new();
        }

        let mut section = format!("\n{}:\n", title);
        for (offset, entry) in history[start..end].iter().enumerate() {
            let round_num = start + offset;
            section.push_str(&format!(
                "Round {}:\nCommand: {}\nExit code: {}\nOutput tail:\n{}\n",
                round_num,
                entry.command.invocation,
                entry.result.exit_code,
                tail_chars(&entry.result.stdout, self.older_budget()),
            ));
            if let Some(analysis) = &entry.analysis {
                section.push_str(&format!("Previous analysis: {}\n", analysis));
            }
        }
        section
    }

    /// Prompt for the full-rewrite patch shape.
    pub fn rewrite_prompt(&self, state: &LoopState, script_path: &str) -> String {
        format!(
            "{}\n\n{}\n\nTARGET SCRIPT FILE: {}\n\n{}\n\
             Analyze the error causes, then output the complete new script for the \
             target file.",
            ANALYSIS_RULES,
            REWRITE_RULES,
            script_path,
            self.failure_context(state),
        )
    }

    /// Prompt for the single-command patch shape.
    pub fn single_command_prompt(&self, state: &LoopState) -> String {
        format!(
            "{}\n\n{}\n\n{}\n\
             Analyze the error causes, then output the single repair command.",
            ANALYSIS_RULES,
            SINGLE_COMMAND_RULES,
            self.failure_context(state),
        )
    }

    /// Divergence instruction appended when the collaborator repeats an
    /// equivalent patch for a recurring error.
    pub fn divergence_note(prior: &[String]) -> String {
        let mut note = String::from(
            "\nYou already proposed the following and the error persists; \
             produce a materially different strategy this time:\n",
        );
        for patch in prior {
            let summary: String = patch.chars().take(200).collect();
            note.push_str(&format!("- {}\n", summary));
        }
        note
    }

    /// Reminder appended when a shared-library error was answered with a
    /// language-package install.
    pub fn shared_library_note() -> String {
        "\nThe error is a missing shared library. Install the system package \
         through the OS package manager (apt-get/yum/apk); do not use pip or \
         another language package manager.\n"
            .to_string()
    }

    /// Prompt for test selection: catalog with per-command stats plus the
    /// last failure tail.
    pub fn selection_prompt(&self, state: &LoopState) -> String {
        let mut prompt = format!("{}\n\nAVAILABLE COMMANDS:\n", SELECTION_RULES);
        for level in TestCatalog::LEVELS {
            let bucket = state.test_catalog.bucket(level);
            if bucket.is_empty() {
                continue;
            }
            prompt.push_str(&format!("\n{} ({}):\n", level, bucket.len()));
            for cmd in bucket {
                prompt.push_str(&format!("  - {}\n", cmd));
            }
        }

        prompt.push_str("\nEXECUTION SUMMARY:\n");
        let stats = command_stats(&state.test_history);
        if stats.is_empty() {
            prompt.push_str("No commands have been executed yet.\n");
        } else {
            prompt.push_str(&format!(
                "Current maturity: {}\n",
                state.maturity()
            ));
            let mut by_level: BTreeMap<String, Vec<&CommandStats>> = BTreeMap::new();
            for stat in &stats {
                by_level
                    .entry(stat.level.map(|l| l.to_string()).unwrap_or_else(|| "unknown".into()))
                    .or_default()
                    .push(stat);
            }
            for (level, entries) in by_level {
                prompt.push_str(&format!("\nLevel: {}\n", level));
                for stat in entries {
                    let symbol = if stat.last_passed { "PASSED" } else { "FAILED" };
                    prompt.push_str(&format!(
                        "  {} - {} (executed {} time(s): {} passed, {} failed)\n",
                        stat.command, symbol, stat.total, stat.passed, stat.failed
                    ));
                }
            }
        }

        if let Some(last_failure) = state
            .test_history
            .iter()
            .rev()
            .find(|entry| !entry.ok)
        {
            prompt.push_str(&format!(
                "\nLAST FAILURE ({}):\n{}\n",
                last_failure.command.invocation,
                tail_chars(&last_failure.result.stdout, self.older_budget()),
            ));
        }

        prompt.push_str("\nSelect the next command to execute.");
        prompt
    }

    /// Prompt for one-time catalog normalization.
    pub fn normalization_prompt(&self, catalog: &TestCatalog, advisory: &[String]) -> String {
        let mut prompt = format!("{}\n\nDISCOVERED COMMANDS:\n", NORMALIZE_RULES);
        for level in TestCatalog::LEVELS {
            for cmd in catalog.bucket(level) {
                prompt.push_str(&format!("{}: {}\n", level, cmd));
            }
        }
        if !advisory.is_empty() {
            prompt.push_str("\nSEARCH SNIPPETS (advisory only):\n");
            for chunk in advisory {
                prompt.push_str(&format!("- {}\n", tail_chars(chunk, self.older_budget())));
            }
        }
        prompt.push_str("\nReturn the cleaned catalog.");
        prompt
    }
}

/// Per-command, per-level pass/fail counters over the test history.
#[derive(Debug, Clone)]
pub struct CommandStats {
    pub command: String,
    pub level: Option<TestLevel>,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub last_passed: bool,
}

/// Aggregate stats in first-seen order.
pub fn command_stats(test_history: &[RoundEntry]) -> Vec<CommandStats> {
    let mut order: Vec<(String, Option<TestLevel>)> = Vec::new();
    let mut map: BTreeMap<usize, CommandStats> = BTreeMap::new();

    for entry in test_history {
        let key = (entry.command.invocation.clone(), entry.level);
        let index = match order.iter().position(|k| *k == key) {
            Some(i) => i,
            None => {
                order.push(key.clone());
                let i = order.len() - 1;
                map.insert(
                    i,
                    CommandStats {
                        command: key.0,
                        level: key.1,
                        total: 0,
                        passed: 0,
                        failed: 0,
                        last_passed: false,
                    },
                );
                i
            }
        };
        let stat = map.get_mut(&index).expect("stat just inserted");
        stat.total += 1;
        if entry.ok {
            stat.passed += 1;
            stat.last_passed = true;
        } else {
            stat.failed += 1;
            stat.last_passed = false;
        }
    }

    map.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Budget, CommandRecord, RoundTag, TestResult};
    use envloop_adapter::ExecResult;

    fn state_with_failure() -> LoopState {
        let mut state = LoopState::new(
            CommandRecord::script("bash /app/envloop_setup.sh", "#!/bin/bash\npip install x\n"),
            TestCatalog {
                build: vec!["make".into()],
                level1: vec!["./server".into()],
                ..Default::default()
            },
            Budget::from_config(&Default::default()),
        );
        state.selected_test = Some("make".into());
        state.record_installer_round(ExecResult::new(
            1,
            "ModuleNotFoundError: No module named 'cv2'",
            "",
        ));
        state
    }

    #[test]
    fn test_rewrite_prompt_contains_contract_pieces() {
        let assembler = ContextAssembler::new(3, 1500);
        let state = state_with_failure();
        let prompt = assembler.rewrite_prompt(&state, "envloop_setup.sh");

        assert!(prompt.contains("TARGET SCRIPT FILE: envloop_setup.sh"));
        assert!(prompt.contains("cannot open shared object file"));
        assert!(prompt.contains("ModuleNotFoundError"));
        assert!(prompt.contains("written to disk verbatim"));
        assert!(prompt.contains("pip install x"));
        assert!(prompt.contains("No module named 'cv2'"));
    }

    #[test]
    fn test_current_round_gets_full_budget_older_rounds_half() {
        let assembler = ContextAssembler::new(3, 1000);
        let mut state = state_with_failure();
        // add an older round with a long stdout
        state.record_installer_round(ExecResult::new(1, "y".repeat(5000), ""));
        state.record_installer_round(ExecResult::new(1, "z".repeat(5000), ""));

        let prompt = assembler.single_command_prompt(&state);
        // current round: 1000 z's; older round: 500 y's
        assert!(prompt.contains(&"z".repeat(1000)));
        assert!(!prompt.contains(&"z".repeat(1001)));
        assert!(prompt.contains(&"y".repeat(500)));
        assert!(!prompt.contains(&"y".repeat(501)));
    }

    #[test]
    fn test_prior_analyses_are_surfaced() {
        let assembler = ContextAssembler::new(3, 1500);
        let mut state = state_with_failure();
        state.attach_analysis(RoundTag::Installer, "cv2 is missing from the venv");
        state.record_installer_round(ExecResult::new(1, "same error", ""));

        let prompt = assembler.single_command_prompt(&state);
        assert!(prompt.contains("Previous analysis: cv2 is missing from the venv"));
    }

    #[test]
    fn test_history_window_limits_rounds() {
        let assembler = ContextAssembler::new(2, 100);
        let mut state = state_with_failure();
        for i in 0..6 {
            state.record_installer_round(ExecResult::new(1, format!("failure {}", i), ""));
        }

        let prompt = assembler.single_command_prompt(&state);
        // last round (failure 5) is the current one; the window shows 3 and 4
        assert!(prompt.contains("failure 4"));
        assert!(prompt.contains("failure 3"));
        assert!(!prompt.contains("failure 2"));
    }

    #[test]
    fn test_selection_prompt_shows_stats_and_last_failure() {
        let assembler = ContextAssembler::new(3, 1500);
        let mut state = state_with_failure();
        state.record_test_round(
            "make".into(),
            Some(TestLevel::Build),
            ExecResult::new(2, "make: *** [all] Error 2", ""),
            TestResult::Exec(ExecResult::new(2, "make: *** [all] Error 2", "")),
        );
        state.record_test_round(
            "make".into(),
            Some(TestLevel::Build),
            ExecResult::new(0, "ok", ""),
            TestResult::Exec(ExecResult::new(0, "ok", "")),
        );

        let prompt = assembler.selection_prompt(&state);
        assert!(prompt.contains("build (1):"));
        assert!(prompt.contains("level1 (1):"));
        assert!(prompt.contains("executed 2 time(s): 1 passed, 1 failed"));
        assert!(prompt.contains("LAST FAILURE (make):"));
        assert!(prompt.contains("Error 2"));
    }

    #[test]
    fn test_command_stats_aggregation() {
        let mut state = state_with_failure();
        for exit in [1, 1, 0] {
            state.record_test_round(
                "make".into(),
                Some(TestLevel::Build),
                ExecResult::new(exit, "", ""),
                TestResult::Exec(ExecResult::new(exit, "", "")),
            );
        }
        let stats = command_stats(&state.test_history);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 3);
        assert_eq!(stats[0].failed, 2);
        assert_eq!(stats[0].passed, 1);
        assert!(stats[0].last_passed);
    }
}
