//! Verification execution
//!
//! Two modes, chosen at orchestrator start and never switched: direct exec
//! of the selected command, or an import-scan that collects the test suite
//! without running assertions and parses the failures into structured
//! issues.

use crate::model::{TestResult, VerificationIssue};
use crate::{CoreError, Result};
use envloop_adapter::{ContainerAdapter, ExecResult, FileEntry};
use envloop_config::{TimeoutConfig, VerifyMode};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the collection-check script placed in the container workdir.
pub const COLLECT_SCRIPT_NAME: &str = "envloop_collect_check.sh";

/// The embedded collection check. Collects the suite without executing
/// assertions; exit 5 means "no tests found" and counts as a pass.
pub const COLLECT_SCRIPT: &str = r#"#!/bin/bash
PROJECT_DIR="${1:-.}"
cd "$PROJECT_DIR" || exit 1

if ! command -v pytest >/dev/null 2>&1; then
    echo "Error: pytest command not found"
    exit 100
fi

pytest --collect-only -q
"#;

/// Exit code the check script reports when pytest is absent.
const MISSING_PYTEST_EXIT: i64 = 100;

/// Parses collection output into structured issues. One implementation
/// per ecosystem; pytest is provided.
pub trait CollectionParser: Send + Sync {
    fn ecosystem(&self) -> &str;

    /// Extract issues from a failing collection run. Returning `Err` means
    /// the output was unreadable; the caller degrades it to a dedicated
    /// issue rather than failing the loop.
    fn parse(&self, output: &str) -> Result<Vec<VerificationIssue>>;

    /// Total error count the tool itself reported, when its output states
    /// one. May exceed the number of parsed issues.
    fn total_errors(&self, _output: &str) -> Option<usize> {
        None
    }
}

/// Parser for `pytest --collect-only` output.
pub struct PytestCollectParser {
    block_split: Regex,
    block_header: Regex,
    error_type: Regex,
    error_line: Regex,
    missing_module: Regex,
    total_errors: Regex,
}

impl Default for PytestCollectParser {
    fn default() -> Self {
        Self {
            block_split: Regex::new(r"_{2,}\s+ERROR collecting\s+").expect("static regex"),
            block_header: Regex::new(r"_{2,}.*$").expect("static regex"),
            error_type: Regex::new(r"(?m)^(\w+Error)\s+while\s+importing").expect("static regex"),
            error_line: Regex::new(r"(?m)^E\s+(.+)$").expect("static regex"),
            missing_module: Regex::new(r#"No module named ['"](.+?)['"]"#).expect("static regex"),
            total_errors: Regex::new(r"no tests collected,\s*(\d+)\s+errors?")
                .expect("static regex"),
        }
    }
}

impl PytestCollectParser {
    /// Unique missing modules across all issues, sorted.
    pub fn missing_modules(issues: &[VerificationIssue]) -> Vec<String> {
        issues
            .iter()
            .filter_map(|i| i.missing_module.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl CollectionParser for PytestCollectParser {
    fn ecosystem(&self) -> &str {
        "pytest"
    }

    fn parse(&self, output: &str) -> Result<Vec<VerificationIssue>> {
        let mut issues = Vec::new();

        for block in self.block_split.split(output).skip(1) {
            let mut lines = block.lines();
            let Some(first) = lines.next() else { continue };
            let file = self.block_header.replace(first, "").trim().to_string();
            if file.is_empty() {
                continue;
            }

            let mut error_kind = None;
            let mut message = None;
            let mut missing_module = None;

            for line in block.lines() {
                if line.contains("short test summary info") {
                    break;
                }
                if let Some(captures) = self.error_type.captures(line) {
                    error_kind = Some(captures[1].to_string());
                }
                if let Some(captures) = self.error_line.captures(line) {
                    let text = captures[1].trim().to_string();
                    if let Some(module) = self.missing_module.captures(&text) {
                        missing_module = Some(module[1].to_string());
                        error_kind.get_or_insert_with(|| "ModuleNotFoundError".to_string());
                    }
                    // the last E-line in a block wins
                    message = Some(text);
                }
            }

            issues.push(VerificationIssue {
                file,
                error_kind: error_kind.unwrap_or_else(|| "CollectionError".to_string()),
                missing_module,
                message: message.unwrap_or_default(),
            });
        }

        if issues.is_empty() {
            return Err(CoreError::Parse(
                "no ERROR collecting blocks found in pytest output".to_string(),
            ));
        }
        Ok(issues)
    }

    fn total_errors(&self, output: &str) -> Option<usize> {
        self.total_errors
            .captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Runs the selected verification command and interprets the outcome.
pub struct VerificationExecutor {
    mode: VerifyMode,
    adapter: Arc<dyn ContainerAdapter>,
    timeout: TimeoutConfig,
    parser: Box<dyn CollectionParser>,
    script_installed: AtomicBool,
}

impl VerificationExecutor {
    pub fn new(mode: VerifyMode, adapter: Arc<dyn ContainerAdapter>, timeout: TimeoutConfig) -> Self {
        Self {
            mode,
            adapter,
            timeout,
            parser: Box::new(PytestCollectParser::default()),
            script_installed: AtomicBool::new(false),
        }
    }

    /// Swap the ecosystem parser (import-scan mode only).
    pub fn with_parser(mut self, parser: Box<dyn CollectionParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn mode(&self) -> VerifyMode {
        self.mode
    }

    /// Run one verification round. Returns the raw exec result (kept
    /// verbatim in history) and the mode-specific outcome.
    pub async fn run(&self, selected_command: &str) -> Result<(ExecResult, TestResult)> {
        match self.mode {
            VerifyMode::Exec => {
                tracing::info!("Running verification command: {}", selected_command);
                let result = self
                    .adapter
                    .exec(selected_command, self.timeout.test_secs)
                    .await?;
                tracing::info!("Verification exited with code {}", result.exit_code);
                let outcome = TestResult::Exec(result.clone());
                Ok((result, outcome))
            }
            VerifyMode::ImportScan => self.run_import_scan().await,
        }
    }

    async fn run_import_scan(&self) -> Result<(ExecResult, TestResult)> {
        self.ensure_script().await?;
        let workdir = self.adapter.workdir().to_string();

        tracing::info!("Running environment collection check ({})", self.parser.ecosystem());
        let result = self
            .adapter
            .exec(
                &format!("{}/{} {}", workdir, COLLECT_SCRIPT_NAME, workdir),
                self.timeout.test_secs,
            )
            .await?;

        let issues = self.interpret(&result);
        let missing_modules = PytestCollectParser::missing_modules(&issues);
        let total_errors = if issues.is_empty() {
            None
        } else {
            self.parser.total_errors(&result.stdout)
        };
        let outcome = TestResult::Collection {
            exit_code: result.exit_code,
            issues,
            missing_modules,
            total_errors,
        };
        Ok((result, outcome))
    }

    /// Place and chmod the check script once per run.
    async fn ensure_script(&self) -> Result<()> {
        if self.script_installed.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.adapter
            .put_files(&[FileEntry::text(COLLECT_SCRIPT_NAME, COLLECT_SCRIPT)])
            .await?;
        let chmod = self
            .adapter
            .exec(
                &format!("chmod +x {}", COLLECT_SCRIPT_NAME),
                self.timeout.default_secs,
            )
            .await?;
        if !chmod.success() {
            tracing::warn!("chmod on check script failed: {}", chmod.stderr);
        }
        self.script_installed.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Map the script result to issues per the mode's contract.
    fn interpret(&self, result: &ExecResult) -> Vec<VerificationIssue> {
        if result.stdout.contains("pytest command not found")
            || result.exit_code == MISSING_PYTEST_EXIT
        {
            return vec![VerificationIssue {
                file: String::new(),
                error_kind: "MissingPytest".to_string(),
                missing_module: Some("pytest".to_string()),
                message: "pytest is not installed in the environment; install it with \
                          the interpreter that runs the tests"
                    .to_string(),
            }];
        }

        match result.exit_code {
            // 5 = no tests found: counts as a pass
            0 | 5 => Vec::new(),
            _ => match self.parser.parse(&result.stdout) {
                Ok(issues) => issues,
                Err(e) => {
                    tracing::warn!("Collection output unparseable: {}", e);
                    vec![VerificationIssue {
                        file: String::new(),
                        error_kind: "CollectionParse".to_string(),
                        missing_module: None,
                        message: format!(
                            "collection run exited {} but its output could not be parsed: {}",
                            result.exit_code, e
                        ),
                    }]
                }
            },
        }
    }
}
