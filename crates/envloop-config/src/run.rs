//! Run configuration for the repair loop
//!
//! Defaults live here; a TOML file at `~/.config/envloop/config.toml` (or an
//! explicit path) overrides them, and CLI flags override both.

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the loop verifies that the environment works.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Run the selected test command directly; exit code 0 means pass.
    Exec,
    /// Run a test-collection check and parse its output into issues.
    ImportScan,
}

impl std::fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::ImportScan => write!(f, "import_scan"),
        }
    }
}

impl std::str::FromStr for VerifyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exec" => Ok(Self::Exec),
            "import_scan" | "import-scan" => Ok(Self::ImportScan),
            _ => Err(format!("Unknown verify mode: {}", s)),
        }
    }
}

/// Shape of the analyzer's patch output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    /// Replace the whole installer script each round.
    RewriteFull,
    /// Emit one targeted shell command each round.
    SingleCommand,
}

impl std::fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RewriteFull => write!(f, "rewrite_full"),
            Self::SingleCommand => write!(f, "single_command"),
        }
    }
}

impl std::str::FromStr for PatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rewrite_full" | "rewrite-full" => Ok(Self::RewriteFull),
            "single_command" | "single-command" => Ok(Self::SingleCommand),
            _ => Err(format!("Unknown patch strategy: {}", s)),
        }
    }
}

/// Retry budgets for the loop. All counts are per run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Router entries before the run is abandoned.
    pub global_ticks: u32,
    /// Analyzer patch rounds.
    pub rewrite_rounds: u32,
    /// Test executions.
    pub test_rounds: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            global_ticks: 200,
            rewrite_rounds: 10,
            test_rounds: 20,
        }
    }
}

/// Per-command timeouts in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Short utility commands (chmod, rm, mkdir).
    pub default_secs: u64,
    /// Installer scripts and test commands.
    pub test_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 120,
            test_secs: 1800,
        }
    }
}

/// Full configuration for one repair run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Verification mode, fixed for the whole run.
    pub mode: VerifyMode,
    /// Analyzer output shape, fixed for the whole run.
    pub patch_strategy: PatchStrategy,
    pub budget: BudgetConfig,
    pub timeout: TimeoutConfig,
    /// Prior rounds shown to the analyzer.
    pub history_window: usize,
    /// Tail budget (chars) per round of stdout handed to the analyzer.
    pub stdout_truncate_chars: usize,
    /// Whether to bind-mount the host project into the container.
    pub bind_mount: bool,
    /// Working directory inside the container.
    pub workdir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: VerifyMode::Exec,
            patch_strategy: PatchStrategy::RewriteFull,
            budget: BudgetConfig::default(),
            timeout: TimeoutConfig::default(),
            history_window: 3,
            stdout_truncate_chars: 1500,
            bind_mount: false,
            workdir: "/app".to_string(),
        }
    }
}

impl RunConfig {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "envloop").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.budget.global_ticks == 0 {
            return Err(ConfigError::Invalid(
                "budget.global_ticks must be at least 1".to_string(),
            ));
        }
        if self.timeout.default_secs == 0 || self.timeout.test_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be at least 1 second".to_string(),
            ));
        }
        if self.stdout_truncate_chars == 0 {
            return Err(ConfigError::Invalid(
                "stdout_truncate_chars must be at least 1".to_string(),
            ));
        }
        if !self.workdir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "workdir must be an absolute container path, got {}",
                self.workdir
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.mode, VerifyMode::Exec);
        assert_eq!(config.patch_strategy, PatchStrategy::RewriteFull);
        assert_eq!(config.budget.global_ticks, 200);
        assert_eq!(config.budget.rewrite_rounds, 10);
        assert_eq!(config.budget.test_rounds, 20);
        assert_eq!(config.timeout.default_secs, 120);
        assert_eq!(config.timeout.test_secs, 1800);
        assert_eq!(config.history_window, 3);
        assert_eq!(config.stdout_truncate_chars, 1500);
        assert!(!config.bind_mount);
        assert_eq!(config.workdir, "/app");
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let config = RunConfig::load_from(Path::new("/tmp/envloop_missing_config.toml")).unwrap();
        assert_eq!(config.budget.global_ticks, 200);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
mode = "import_scan"

[budget]
rewrite_rounds = 2
"#,
        )
        .unwrap();

        let config = RunConfig::load_from(&path).unwrap();
        assert_eq!(config.mode, VerifyMode::ImportScan);
        assert_eq!(config.budget.rewrite_rounds, 2);
        // untouched sections keep their defaults
        assert_eq!(config.budget.test_rounds, 20);
        assert_eq!(config.timeout.test_secs, 1800);
    }

    #[test]
    fn test_load_invalid_toml_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "mode = [not toml").unwrap();

        assert!(RunConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let mut config = RunConfig::default();
        config.budget.global_ticks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_workdir() {
        let mut config = RunConfig::default();
        config.workdir = "app".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_round_trip() {
        assert_eq!(VerifyMode::from_str("exec").unwrap(), VerifyMode::Exec);
        assert_eq!(
            VerifyMode::from_str("import-scan").unwrap(),
            VerifyMode::ImportScan
        );
        assert_eq!(VerifyMode::ImportScan.to_string(), "import_scan");
        assert!(VerifyMode::from_str("bogus").is_err());
    }

    #[test]
    fn test_patch_strategy_round_trip() {
        assert_eq!(
            PatchStrategy::from_str("rewrite_full").unwrap(),
            PatchStrategy::RewriteFull
        );
        assert_eq!(
            PatchStrategy::from_str("single-command").unwrap(),
            PatchStrategy::SingleCommand
        );
        assert!(PatchStrategy::from_str("partial").is_err());
    }
}
