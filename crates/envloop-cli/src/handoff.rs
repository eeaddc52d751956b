//! Cold-stage handoff loading
//!
//! The discovery stage leaves two artifacts: the first installer script
//! and a JSON catalog mapping levels to commands. Both are read here and
//! turned into the loop's seed state.

use anyhow::{Context, Result};
use envloop_core::{CommandRecord, TestCatalog};
use std::path::Path;

/// Load the installer script relative to the project directory and wrap
/// it in the invocation that runs it inside the container workdir.
pub fn load_installer(project: &Path, script_relative: &str, workdir: &str) -> Result<CommandRecord> {
    let script_path = project.join(script_relative);
    let body = std::fs::read_to_string(&script_path)
        .with_context(|| format!("reading installer script {}", script_path.display()))?;
    let invocation = format!(
        "bash {}/{}",
        workdir.trim_end_matches('/'),
        script_relative.trim_start_matches('/')
    );
    Ok(CommandRecord::script(invocation, body))
}

/// Load the test catalog JSON (`{"build": [...], "level1": [...], ...}`).
pub fn load_catalog(path: &Path) -> Result<TestCatalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading test catalog {}", path.display()))?;
    let catalog: TestCatalog = serde_json::from_str(&content)
        .with_context(|| format!("parsing test catalog {}", path.display()))?;
    Ok(catalog)
}
