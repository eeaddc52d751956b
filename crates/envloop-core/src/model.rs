//! Data model for the repair loop
//!
//! Everything here is plain data: history entries reference commands by
//! value copy, never by pointer, so a serialized snapshot is
//! self-contained.

use envloop_adapter::ExecResult;
use envloop_config::BudgetConfig;
use serde::{Deserialize, Serialize};

/// A command the loop ran or is about to run.
///
/// `file_content` is the script body when `invocation` executes a file
/// (e.g. `bash /app/envloop_setup.sh`), `None` for a bare one-liner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub invocation: String,
    pub file_content: Option<String>,
}

impl CommandRecord {
    /// A command that executes a script file.
    pub fn script(invocation: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            file_content: Some(body.into()),
        }
    }

    /// A bare shell one-liner.
    pub fn one_liner(invocation: impl Into<String>) -> Self {
        Self {
            invocation: invocation.into(),
            file_content: None,
        }
    }
}

/// Which stream of the loop a round belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundTag {
    Installer,
    Test,
}

/// One execute → observe → (optionally) analyze cycle. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEntry {
    pub command: CommandRecord,
    pub result: ExecResult,
    /// Whether the round passed under the active verification rules. For
    /// import-scan rounds this differs from a bare exit-code check: exit
    /// code 5 ("no tests") passes, and anything with issues fails.
    pub ok: bool,
    pub analysis: Option<String>,
    pub tag: RoundTag,
    /// Catalog level of the command for test rounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<TestLevel>,
}

/// Verification command levels.
///
/// `Build` is a pre-phase: something from it must pass before any other
/// level may be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestLevel {
    #[serde(rename = "build")]
    Build,
    /// Level 1: runs the software (`python main.py`, `npm start`).
    #[serde(rename = "level1")]
    Entry,
    /// Level 2: tests with real dependencies.
    #[serde(rename = "level2")]
    Integration,
    /// Level 3: minimal invocations (`tool --version`, `make check`).
    #[serde(rename = "level3")]
    Smoke,
    /// Level 4: fine-grained tests (`pytest -q`, `go test`).
    #[serde(rename = "level4")]
    Unit,
}

impl TestLevel {
    /// Funnel-defense phase of this level.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Build | Self::Smoke => Phase::Preflight,
            Self::Entry => Phase::Primary,
            Self::Integration => Phase::Fallback,
            Self::Unit => Phase::Diagnostic,
        }
    }
}

impl std::fmt::Display for TestLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Entry => write!(f, "level1"),
            Self::Integration => write!(f, "level2"),
            Self::Smoke => write!(f, "level3"),
            Self::Unit => write!(f, "level4"),
        }
    }
}

impl std::str::FromStr for TestLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "build" => Ok(Self::Build),
            "level1" | "1" => Ok(Self::Entry),
            "level2" | "2" => Ok(Self::Integration),
            "level3" | "3" => Ok(Self::Smoke),
            "level4" | "4" => Ok(Self::Unit),
            _ => Err(format!("Unknown test level: {}", s)),
        }
    }
}

/// A verification command with its level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    pub text: String,
    pub level: TestLevel,
}

/// The discovered verification commands, one bucket per level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCatalog {
    pub build: Vec<String>,
    pub level1: Vec<String>,
    pub level2: Vec<String>,
    pub level3: Vec<String>,
    pub level4: Vec<String>,
}

impl TestCatalog {
    pub fn bucket(&self, level: TestLevel) -> &Vec<String> {
        match level {
            TestLevel::Build => &self.build,
            TestLevel::Entry => &self.level1,
            TestLevel::Integration => &self.level2,
            TestLevel::Smoke => &self.level3,
            TestLevel::Unit => &self.level4,
        }
    }

    pub fn bucket_mut(&mut self, level: TestLevel) -> &mut Vec<String> {
        match level {
            TestLevel::Build => &mut self.build,
            TestLevel::Entry => &mut self.level1,
            TestLevel::Integration => &mut self.level2,
            TestLevel::Smoke => &mut self.level3,
            TestLevel::Unit => &mut self.level4,
        }
    }

    pub const LEVELS: [TestLevel; 5] = [
        TestLevel::Build,
        TestLevel::Entry,
        TestLevel::Integration,
        TestLevel::Smoke,
        TestLevel::Unit,
    ];

    pub fn is_empty(&self) -> bool {
        Self::LEVELS.iter().all(|l| self.bucket(*l).is_empty())
    }

    pub fn len(&self) -> usize {
        Self::LEVELS.iter().map(|l| self.bucket(*l).len()).sum()
    }

    /// Find which bucket holds a command.
    pub fn level_of(&self, command: &str) -> Option<TestLevel> {
        Self::LEVELS
            .iter()
            .copied()
            .find(|l| self.bucket(*l).iter().any(|c| c == command))
    }

    /// Trim entries, drop empties and pure comments, dedupe within and
    /// across buckets (first bucket in `LEVELS` order wins).
    pub fn prefilter(&self) -> TestCatalog {
        let mut seen = std::collections::HashSet::new();
        let mut out = TestCatalog::default();
        for level in Self::LEVELS {
            for cmd in self.bucket(level) {
                let cmd = cmd.trim();
                if cmd.is_empty() || cmd.starts_with('#') {
                    continue;
                }
                if seen.insert(cmd.to_string()) {
                    out.bucket_mut(level).push(cmd.to_string());
                }
            }
        }
        out
    }
}

/// Funnel-defense phase of an execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Preflight,
    Primary,
    Fallback,
    Diagnostic,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preflight => write!(f, "Pre-flight"),
            Self::Primary => write!(f, "Primary"),
            Self::Fallback => write!(f, "Fallback"),
            Self::Diagnostic => write!(f, "Diagnostic"),
        }
    }
}

/// One entry of the planner's ordered execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub order: u32,
    pub command: String,
    pub level: TestLevel,
    pub phase: Phase,
    /// Stop the whole loop if this command succeeds (entry points).
    pub stop_on_success: bool,
    /// Stop the whole loop if this command fails (smoke checks).
    pub is_blocking: bool,
}

/// A structured failure extracted from an import-scan run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub file: String,
    pub error_kind: String,
    pub missing_module: Option<String>,
    pub message: String,
}

/// Outcome of one verification round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestResult {
    /// Direct exec mode: the raw result.
    Exec(ExecResult),
    /// Import-scan mode: parsed issues. Exit code 5 means "no tests" and
    /// yields an empty issue list.
    Collection {
        exit_code: i64,
        issues: Vec<VerificationIssue>,
        missing_modules: Vec<String>,
        /// Total error count the tool itself reported, when its output
        /// stated one; may exceed the number of parsed issues.
        total_errors: Option<usize>,
    },
}

impl TestResult {
    pub fn ok(&self) -> bool {
        match self {
            Self::Exec(result) => result.success(),
            Self::Collection { issues, .. } => issues.is_empty(),
        }
    }
}

/// Remaining retry budgets. Monotonically non-increasing, never negative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub global_ticks_left: u32,
    pub rewrite_rounds_left: u32,
    pub test_rounds_left: u32,
}

impl Budget {
    pub fn from_config(config: &BudgetConfig) -> Self {
        Self {
            global_ticks_left: config.global_ticks,
            rewrite_rounds_left: config.rewrite_rounds,
            test_rounds_left: config.test_rounds,
        }
    }

    pub fn take_tick(&mut self) {
        self.global_ticks_left = self.global_ticks_left.saturating_sub(1);
    }

    pub fn take_rewrite(&mut self) {
        self.rewrite_rounds_left = self.rewrite_rounds_left.saturating_sub(1);
    }

    pub fn take_test(&mut self) {
        self.test_rounds_left = self.test_rounds_left.saturating_sub(1);
    }

    /// Name of the first exhausted budget, if any.
    pub fn exhausted(&self) -> Option<&'static str> {
        if self.global_ticks_left == 0 {
            Some("global_ticks")
        } else if self.rewrite_rounds_left == 0 {
            Some("rewrite_rounds")
        } else if self.test_rounds_left == 0 {
            Some("test_rounds")
        } else {
            None
        }
    }
}

/// Success flags derived from the last results.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CheckFlags {
    pub installer_ok: bool,
    pub test_ok: bool,
}

/// How far environment bring-up has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Maturity {
    /// No build passed.
    Unknown,
    /// A build passed, nothing else.
    Installable,
    /// A build passed and at least one smoke or unit command passed.
    Testable,
    /// A build passed and at least one entry or integration command
    /// passed. The success target.
    Runnable,
}

impl Maturity {
    /// Derive the tier from the test history alone.
    pub fn from_history(test_history: &[RoundEntry]) -> Self {
        let passed_level = |levels: &[TestLevel]| {
            test_history.iter().any(|entry| {
                entry.ok && entry.level.map(|l| levels.contains(&l)).unwrap_or(false)
            })
        };

        if !passed_level(&[TestLevel::Build]) {
            return Self::Unknown;
        }
        if passed_level(&[TestLevel::Entry, TestLevel::Integration]) {
            return Self::Runnable;
        }
        if passed_level(&[TestLevel::Smoke, TestLevel::Unit]) {
            return Self::Testable;
        }
        Self::Installable
    }
}

impl std::fmt::Display for Maturity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Installable => write!(f, "installable"),
            Self::Testable => write!(f, "testable"),
            Self::Runnable => write!(f, "runnable"),
        }
    }
}

/// The single mutable state object owned by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// Run identifier (UUID).
    pub run_id: String,
    /// Monotonic tick counter; snapshots are keyed by it.
    pub tick: u64,
    pub current_installer: CommandRecord,
    pub last_installer_result: Option<ExecResult>,
    pub installer_history: Vec<RoundEntry>,
    pub test_catalog: TestCatalog,
    pub selected_test: Option<String>,
    pub selected_test_level: Option<TestLevel>,
    pub last_test_result: Option<TestResult>,
    pub test_history: Vec<RoundEntry>,
    pub error_analysis: String,
    pub budget: Budget,
    pub check: CheckFlags,
}

impl LoopState {
    pub fn new(installer: CommandRecord, catalog: TestCatalog, budget: Budget) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            tick: 0,
            current_installer: installer,
            last_installer_result: None,
            installer_history: Vec::new(),
            test_catalog: catalog,
            selected_test: None,
            selected_test_level: None,
            last_test_result: None,
            test_history: Vec::new(),
            error_analysis: String::new(),
            budget,
            check: CheckFlags::default(),
        }
    }

    /// Record one installer execution.
    pub fn record_installer_round(&mut self, result: ExecResult) {
        self.installer_history.push(RoundEntry {
            command: self.current_installer.clone(),
            result: result.clone(),
            ok: result.success(),
            analysis: None,
            tag: RoundTag::Installer,
            level: None,
        });
        self.last_installer_result = Some(result);
    }

    /// Record one verification execution. `raw` is the exec result kept
    /// verbatim in history; `outcome` carries the mode-specific reading
    /// and decides whether the round counts as passed.
    pub fn record_test_round(
        &mut self,
        command: String,
        level: Option<TestLevel>,
        raw: ExecResult,
        outcome: TestResult,
    ) {
        self.test_history.push(RoundEntry {
            command: CommandRecord::one_liner(command),
            result: raw,
            ok: outcome.ok(),
            analysis: None,
            tag: RoundTag::Test,
            level,
        });
        self.last_test_result = Some(outcome);
    }

    /// Attach the analyzer's text to the most recent round of the given
    /// stream, and remember it as the run-level analysis.
    pub fn attach_analysis(&mut self, tag: RoundTag, analysis: &str) {
        let history = match tag {
            RoundTag::Installer => &mut self.installer_history,
            RoundTag::Test => &mut self.test_history,
        };
        if let Some(last) = history.last_mut() {
            last.analysis = Some(analysis.to_string());
        }
        self.error_analysis = analysis.to_string();
    }

    /// Replace the installer with the analyzer's patch and force
    /// re-execution.
    pub fn replace_installer(&mut self, record: CommandRecord) {
        self.current_installer = record;
        self.last_installer_result = None;
    }

    pub fn select_test(&mut self, command: String, level: TestLevel) {
        self.selected_test = Some(command);
        self.selected_test_level = Some(level);
        self.last_test_result = None;
    }

    /// Recompute `check` from the last results. This is the only place
    /// the flags change.
    pub fn refresh_check(&mut self) {
        self.check.installer_ok = self
            .last_installer_result
            .as_ref()
            .map(|r| r.success())
            .unwrap_or(false);
        self.check.test_ok = self
            .last_test_result
            .as_ref()
            .map(|r| r.ok())
            .unwrap_or(false);
    }

    pub fn maturity(&self) -> Maturity {
        Maturity::from_history(&self.test_history)
    }

    /// Whether some build command has passed.
    pub fn build_passed(&self) -> bool {
        self.maturity() >= Maturity::Installable
    }

    /// A self-contained copy with every stored stdout/stderr truncated to
    /// the analyzer's tail budget, suitable for snapshotting.
    pub fn truncated(&self, max_chars: usize) -> LoopState {
        let mut copy = self.clone();
        let trim = |result: &mut ExecResult| {
            result.stdout = tail_chars(&result.stdout, max_chars);
            result.stderr = tail_chars(&result.stderr, max_chars);
        };
        for entry in copy
            .installer_history
            .iter_mut()
            .chain(copy.test_history.iter_mut())
        {
            trim(&mut entry.result);
        }
        if let Some(result) = copy.last_installer_result.as_mut() {
            trim(result);
        }
        if let Some(TestResult::Exec(result)) = copy.last_test_result.as_mut() {
            trim(result);
        }
        copy
    }

    /// Check the cross-field contracts that must hold between ticks.
    pub fn validate(&self) -> crate::Result<()> {
        let installer_ok = self
            .last_installer_result
            .as_ref()
            .map(|r| r.success())
            .unwrap_or(false);
        if self.check.installer_ok != installer_ok {
            return Err(crate::CoreError::InvariantViolation(
                "check.installer_ok diverged from last_installer_result".to_string(),
            ));
        }
        let test_ok = self
            .last_test_result
            .as_ref()
            .map(|r| r.ok())
            .unwrap_or(false);
        if self.check.test_ok != test_ok {
            return Err(crate::CoreError::InvariantViolation(
                "check.test_ok diverged from last_test_result".to_string(),
            ));
        }
        if self.selected_test.is_some() && self.test_catalog.build.is_empty() {
            return Err(crate::CoreError::InvariantViolation(
                "a test was selected from a catalog with no build commands".to_string(),
            ));
        }
        Ok(())
    }
}

/// Last `max_chars` characters of a string, on a char boundary.
pub(crate) fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}
