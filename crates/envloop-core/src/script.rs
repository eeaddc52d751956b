//! Installer script storage
//!
//! The canonical installer lives on the host; this store is its only
//! writer. The container copy is mirrored separately through the adapter.

use crate::Result;
use std::path::{Path, PathBuf};

/// Basenames starting with this prefix belong to envloop and may be
/// overwritten in place. Anything else gets a suffixed sibling instead.
pub const RESERVED_PREFIX: &str = "envloop_";

/// Host-side store for the installer script.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    root: PathBuf,
}

impl ScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a script body, creating parent directories. Returns the
    /// normalized relative path actually written, which differs from the
    /// input when an unrelated file already occupied it.
    pub fn save(&self, relative_path: &str, body: &str) -> Result<String> {
        let relative = normalize(relative_path);
        let target = self.resolve_target(&relative);
        let full = self.root.join(&target);

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, body)?;
        tracing::info!("Saved installer script to {}", full.display());
        Ok(target)
    }

    /// Read a script body back.
    pub fn load(&self, relative_path: &str) -> Result<String> {
        let full = self.root.join(normalize(relative_path));
        Ok(std::fs::read_to_string(full)?)
    }

    /// Decide where a save lands: reserved-prefix files are overwritten,
    /// foreign files get a `_2` (then `_3`, …) suffixed sibling.
    fn resolve_target(&self, relative: &str) -> String {
        let path = Path::new(relative);
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if !self.root.join(relative).exists() || basename.starts_with(RESERVED_PREFIX) {
            return relative.to_string();
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let parent = path.parent().unwrap_or(Path::new(""));

        let mut counter = 2usize;
        loop {
            let candidate = parent
                .join(format!("{}_{}{}", stem, counter, extension))
                .to_string_lossy()
                .to_string();
            if !self.root.join(&candidate).exists() {
                return candidate;
            }
            counter += 1;
        }
    }
}

/// Strip leading slashes so paths stay inside the store root.
fn normalize(relative_path: &str) -> String {
    relative_path.trim_start_matches('/').to_string()
}

/// Extract the script path, relative to the container workdir, from an
/// installer invocation like `bash /app/envloop_setup.sh`.
pub fn relative_path_from_invocation(invocation: &str, workdir: &str) -> Option<String> {
    let rest = invocation.split("bash ").nth(1)?.trim();
    let script = rest.split_whitespace().next()?;
    let prefix = format!("{}/", workdir.trim_end_matches('/'));
    let relative = script.strip_prefix(&prefix).unwrap_or(script);
    Some(normalize(relative))
}
