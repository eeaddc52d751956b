//! Container adapter trait and implementations for envloop
//!
//! This crate provides an abstraction over container backends (docker CLI,
//! daemon API) with a uniform interface for the repair loop: image build,
//! container lifecycle, command exec with timeout and exit-code capture,
//! and two-way file sync between host and container.

mod cli;
mod docker;
mod error;
mod shell;
mod types;

pub use cli::CliAdapter;
pub use docker::DockerAdapter;
pub use error::*;
pub use types::*;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Trait for container adapters.
///
/// `exec` is synchronous from the loop's perspective: one call, one
/// `ExecResult`. Nothing here interprets what a command means; a nonzero
/// exit code is a normal result. Infrastructure failures (daemon
/// unreachable, image missing) surface as `InfraError` and are fatal to
/// the caller.
#[async_trait]
pub trait ContainerAdapter: Send + Sync {
    /// Build the run image from Dockerfile text.
    async fn build_image(&self, dockerfile: &str) -> Result<ImageId>;

    /// Launch a detached container from the built image, optionally
    /// bind-mounting the staged project read-write for live file sync.
    async fn start(&self, bind_host_project: bool) -> Result<ContainerId>;

    /// Stop and remove the previous container, then start a fresh one.
    async fn restart(&self, bind_host_project: bool) -> Result<ContainerId>;

    /// Run a command under a login shell in the container workdir.
    ///
    /// On timeout the command is killed and the result carries a sentinel
    /// exit code (124 or 137) with a timeout marker appended to stdout.
    /// `timeout_secs == 0` is rejected before anything is sent.
    async fn exec(&self, cmd: &str, timeout_secs: u64) -> Result<ExecResult>;

    /// Place files in the container workdir, creating parents implicitly.
    async fn put_files(&self, files: &[FileEntry]) -> Result<()>;

    /// Remove files from the container workdir.
    async fn remove_files(&self, paths: &[String]) -> Result<()>;

    /// Create directories (and parents) under the container workdir.
    async fn mkdir_p(&self, paths: &[String]) -> Result<()>;

    /// Read up to `max_lines` lines of a file in the container workdir.
    async fn read_file(&self, path: &str, max_lines: usize) -> Result<String>;

    /// Copy files from the host staging copy into the container.
    async fn copy_host_to_container(&self, relative_paths: &[String]) -> Result<()>;

    /// Copy files matching a glob pattern out of the container workdir
    /// into the host staging copy. Returns the host paths written.
    async fn copy_container_to_host(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Stop and remove the container and image, delete the host staging
    /// directory.
    async fn cleanup(&self) -> Result<()>;

    /// Working directory inside the container.
    fn workdir(&self) -> &str;

    /// Host path of the staged project copy.
    fn project_path(&self) -> &Path;

    /// Adapter information.
    fn info(&self) -> AdapterInfo;
}

/// Create an adapter for the given backend.
///
/// `socket` is only consulted by the API backend; the CLI backend talks to
/// whatever daemon the `docker` binary is configured for.
pub async fn create_adapter(
    backend: AdapterBackend,
    project_path: &Path,
    workdir: &str,
    socket: Option<&str>,
) -> Result<Box<dyn ContainerAdapter>> {
    match backend {
        AdapterBackend::DockerCli => {
            let adapter = CliAdapter::new(project_path, workdir).await?;
            Ok(Box::new(adapter))
        }
        AdapterBackend::DockerApi => {
            let socket = socket.unwrap_or("/var/run/docker.sock");
            let adapter = DockerAdapter::new(socket, project_path, workdir).await?;
            Ok(Box::new(adapter))
        }
    }
}

/// Copy a project tree into a fresh temp staging directory.
///
/// The loop mutates the staged copy, never the user's tree. Common
/// build-output and VCS directories are skipped.
pub(crate) fn stage_project(project_path: &Path) -> Result<PathBuf> {
    let name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let staging_root = tempfile::Builder::new()
        .prefix("envloop-")
        .tempdir()?
        .keep();
    let staged = staging_root.join(name);
    copy_tree(project_path, &staged)?;
    tracing::info!("Staged project copy at {}", staged.display());
    Ok(staged)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if matches!(
            name.to_string_lossy().as_ref(),
            ".git" | "node_modules" | "target" | "__pycache__" | ".venv"
        ) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
        }
        // symlinks are dropped; the staged copy must be self-contained
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_project_copies_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("myproj");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src/main.py"), "print('hi')\n").unwrap();
        std::fs::create_dir_all(project.join(".git")).unwrap();
        std::fs::write(project.join(".git/HEAD"), "ref").unwrap();

        let staged = stage_project(&project).unwrap();
        assert!(staged.ends_with("myproj"));
        assert!(staged.join("src/main.py").exists());
        assert!(!staged.join(".git").exists());

        std::fs::remove_dir_all(staged.parent().unwrap()).unwrap();
    }
}
