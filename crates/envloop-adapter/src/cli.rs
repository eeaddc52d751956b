//! CLI-based container adapter
//!
//! Shells out to the `docker` binary instead of the daemon API for:
//! - Automatic credential handling (via ~/.docker/config.json)
//! - Proper user context handling (no permissions issues)
//! - Works with Docker alternatives (Colima, Rancher, Lima, OrbStack)

use crate::shell::{login_shell_argv, timeout_marker};
use crate::{
    stage_project, AdapterBackend, AdapterInfo, ContainerAdapter, ContainerId, ExecResult,
    FileEntry, ImageId, InfraError, Result,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

const DOCKERFILE_NAME: &str = "envloop.Dockerfile";

/// Grace added on top of the in-container `timeout` before the host side
/// kills the `docker exec` process itself.
const HOST_KILL_GRACE_SECS: u64 = 30;

/// CLI-based container adapter
pub struct CliAdapter {
    /// Command to use ("docker")
    cmd: String,
    /// Image tag for this run
    tag: String,
    /// Working directory inside the container
    workdir: String,
    /// Host staging copy of the project
    project_path: PathBuf,
    /// Running container, if any
    container: Mutex<Option<ContainerId>>,
}

impl CliAdapter {
    /// Create a new adapter, staging a copy of the project.
    pub async fn new(project_path: &Path, workdir: &str) -> Result<Self> {
        let staged = stage_project(project_path)?;
        let adapter = Self {
            cmd: "docker".to_string(),
            tag: format!("envloop-run:{}", std::process::id()),
            workdir: workdir.to_string(),
            project_path: staged,
            container: Mutex::new(None),
        };

        // Test connection
        adapter.run_cmd(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| InfraError::ConnectionError(e.to_string()))?;
        Ok(adapter)
    }

    /// Run a docker command and get stdout, treating nonzero exit as an
    /// infrastructure error.
    async fn run_cmd(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| InfraError::RuntimeError(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InfraError::RuntimeError(stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn current_container(&self) -> Result<ContainerId> {
        self.container
            .lock()
            .expect("container lock poisoned")
            .clone()
            .ok_or(InfraError::NotStarted)
    }

    async fn stop_and_remove(&self, id: &ContainerId) {
        if let Err(e) = self.run_cmd(&["stop", "-t", "10", &id.0]).await {
            tracing::warn!("Failed to stop container {}: {}", id.short(), e);
        }
        if let Err(e) = self.run_cmd(&["rm", "-f", &id.0]).await {
            tracing::warn!("Failed to remove container {}: {}", id.short(), e);
        }
    }
}

#[async_trait]
impl ContainerAdapter for CliAdapter {
    async fn build_image(&self, dockerfile: &str) -> Result<ImageId> {
        let dockerfile_path = self.project_path.join(DOCKERFILE_NAME);
        std::fs::write(&dockerfile_path, dockerfile)?;

        let context = self.project_path.to_string_lossy();
        let file_arg = format!("-f={}", dockerfile_path.display());
        let tag_arg = format!("-t={}", self.tag);

        tracing::info!("Building image {}", self.tag);
        self.run_cmd(&["build", &file_arg, &tag_arg, &context])
            .await
            .map_err(|e| InfraError::BuildError(e.to_string()))?;

        let inspect = self
            .run_cmd(&["inspect", "--format={{.Id}}", &self.tag])
            .await?;
        Ok(ImageId::new(inspect.trim()))
    }

    async fn start(&self, bind_host_project: bool) -> Result<ContainerId> {
        tracing::info!("Starting container from image {}", self.tag);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-t".into(),
            "--network=host".into(),
            format!("--env=PYTHONPATH={}", self.workdir),
            "-v".into(),
            "/var/run/docker.sock:/var/run/docker.sock".into(),
        ];
        if bind_host_project {
            args.push("-v".into());
            args.push(format!(
                "{}:{}:rw",
                self.project_path.display(),
                self.workdir
            ));
            tracing::info!(
                "Using volume mapping: {} -> {}",
                self.project_path.display(),
                self.workdir
            );
        }
        args.push(self.tag.clone());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run_cmd(&arg_refs).await?;
        let id = ContainerId::new(output.trim());

        tracing::info!("Container ID: {}", id);
        tracing::info!("To enter container, run: docker exec -it {} /bin/bash", id.short());

        *self.container.lock().expect("container lock poisoned") = Some(id.clone());
        Ok(id)
    }

    async fn restart(&self, bind_host_project: bool) -> Result<ContainerId> {
        tracing::info!("Restarting the container");
        let previous = self
            .container
            .lock()
            .expect("container lock poisoned")
            .take();
        if let Some(id) = previous {
            self.stop_and_remove(&id).await;
        }
        self.start(bind_host_project).await
    }

    async fn exec(&self, cmd: &str, timeout_secs: u64) -> Result<ExecResult> {
        if timeout_secs == 0 {
            return Err(InfraError::InvalidTimeout);
        }
        let id = self.current_container()?;
        let shell = login_shell_argv(cmd, timeout_secs);

        let mut command = Command::new(&self.cmd);
        command
            .arg("exec")
            .arg("-w")
            .arg(&self.workdir)
            .arg(&id.0)
            .args(&shell)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Running command in container: {}", cmd);

        let child = command
            .spawn()
            .map_err(|e| InfraError::RuntimeError(e.to_string()))?;

        // The in-container `timeout` is the real limit; the host-side kill
        // only guards against a wedged docker client.
        let hard_limit = Duration::from_secs(timeout_secs + HOST_KILL_GRACE_SECS);
        let output = match tokio::time::timeout(hard_limit, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| InfraError::RuntimeError(e.to_string()))?,
            Err(_) => {
                tracing::warn!("docker exec did not return, reporting timeout");
                return Ok(ExecResult::new(124, timeout_marker(cmd, timeout_secs), ""));
            }
        };

        let exit_code = output.status.code().unwrap_or(137) as i64;
        let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if exit_code == 124 || exit_code == 137 {
            stdout.push_str(&timeout_marker(cmd, timeout_secs));
        }

        tracing::debug!("Command exited with code {}", exit_code);
        Ok(ExecResult::new(exit_code, stdout, stderr))
    }

    async fn put_files(&self, files: &[FileEntry]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let id = self.current_container()?;

        let dirs: Vec<String> = files
            .iter()
            .filter_map(|f| {
                Path::new(&f.path)
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect();
        if !dirs.is_empty() {
            self.mkdir_p(&dirs).await?;
        }

        let staging = tempfile::tempdir()?;
        for file in files {
            let host_path = staging.path().join(
                Path::new(&file.path)
                    .file_name()
                    .ok_or_else(|| InfraError::RuntimeError(format!("bad path: {}", file.path)))?,
            );
            std::fs::write(&host_path, &file.contents)?;
            let dest = format!("{}:{}/{}", id.0, self.workdir, file.path);
            tracing::debug!("Copying {} into container", file.path);
            self.run_cmd(&["cp", &host_path.to_string_lossy(), &dest])
                .await?;
        }
        Ok(())
    }

    async fn remove_files(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            tracing::debug!("Removing {} in the container", path);
            self.exec(&format!("rm -f {}", path), 120).await?;
        }
        Ok(())
    }

    async fn mkdir_p(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.exec(&format!("mkdir -p {}", path), 120).await?;
        }
        Ok(())
    }

    async fn read_file(&self, path: &str, max_lines: usize) -> Result<String> {
        let result = self
            .exec(&format!("head -n {} {}", max_lines, path), 120)
            .await?;
        if !result.success() {
            return Err(InfraError::RuntimeError(format!(
                "read_file {} failed: {}",
                path, result.stderr
            )));
        }
        Ok(result.stdout)
    }

    async fn copy_host_to_container(&self, relative_paths: &[String]) -> Result<()> {
        let id = self.current_container()?;
        let dirs: Vec<String> = relative_paths
            .iter()
            .filter_map(|p| {
                Path::new(p)
                    .parent()
                    .filter(|d| !d.as_os_str().is_empty())
                    .map(|d| d.to_string_lossy().to_string())
            })
            .collect();
        if !dirs.is_empty() {
            self.mkdir_p(&dirs).await?;
        }
        for rel in relative_paths {
            let src = self.project_path.join(rel);
            let dest = format!("{}:{}/{}", id.0, self.workdir, rel);
            self.run_cmd(&["cp", &src.to_string_lossy(), &dest]).await?;
        }
        Ok(())
    }

    async fn copy_container_to_host(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let id = self.current_container()?;
        let find = self
            .exec(
                &format!("find {} -name '{}' -type f", self.workdir, pattern),
                120,
            )
            .await?;

        let mut copied = Vec::new();
        for line in find.stdout.lines() {
            let container_path = line.trim();
            if container_path.is_empty() {
                continue;
            }
            let Some(rel) = container_path
                .strip_prefix(&self.workdir)
                .map(|r| r.trim_start_matches('/'))
            else {
                continue;
            };
            let host_path = self.project_path.join(rel);
            if let Some(parent) = host_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let src = format!("{}:{}", id.0, container_path);
            self.run_cmd(&["cp", &src, &host_path.to_string_lossy()])
                .await?;
            tracing::info!("Found generated file: {}", host_path.display());
            copied.push(host_path);
        }
        Ok(copied)
    }

    async fn cleanup(&self) -> Result<()> {
        tracing::info!("Cleaning up container and temporary files");
        let previous = self
            .container
            .lock()
            .expect("container lock poisoned")
            .take();
        if let Some(id) = previous {
            self.stop_and_remove(&id).await;
            if let Err(e) = self.run_cmd(&["rmi", "-f", &self.tag]).await {
                tracing::warn!("Failed to remove image {}: {}", self.tag, e);
            }
        }
        if let Some(staging_root) = self.project_path.parent() {
            std::fs::remove_dir_all(staging_root)?;
        }
        Ok(())
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    fn project_path(&self) -> &Path {
        &self.project_path
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            backend: AdapterBackend::DockerCli,
            image_tag: self.tag.clone(),
            workdir: self.workdir.clone(),
        }
    }
}
