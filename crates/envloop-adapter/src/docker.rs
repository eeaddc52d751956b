//! Daemon API adapter implementation using bollard

use crate::shell::{login_shell_argv, timeout_marker};
use crate::{
    stage_project, AdapterBackend, AdapterInfo, ContainerAdapter, ContainerId, ExecResult,
    FileEntry, ImageId, InfraError, Result,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::service::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const DOCKERFILE_NAME: &str = "envloop.Dockerfile";

/// Slack on top of the in-container `timeout` before the API call itself
/// is abandoned.
const HARD_LIMIT_GRACE_SECS: u64 = 60;

/// Container adapter backed by the daemon API
pub struct DockerAdapter {
    client: Docker,
    /// Image tag for this run
    tag: String,
    /// Working directory inside the container
    workdir: String,
    /// Host staging copy of the project
    project_path: PathBuf,
    /// Running container, if any
    container: Mutex<Option<ContainerId>>,
}

impl DockerAdapter {
    /// Create a new adapter connected to the given socket, staging a copy
    /// of the project.
    pub async fn new(socket_path: &str, project_path: &Path, workdir: &str) -> Result<Self> {
        let client = if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| InfraError::ConnectionError(e.to_string()))?
        } else {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| InfraError::ConnectionError(e.to_string()))?
        };

        // Test connection
        client
            .ping()
            .await
            .map_err(|e| InfraError::ConnectionError(e.to_string()))?;

        let staged = stage_project(project_path)?;
        Ok(Self {
            client,
            tag: format!("envloop-run:{}", std::process::id()),
            workdir: workdir.to_string(),
            project_path: staged,
            container: Mutex::new(None),
        })
    }

    fn current_container(&self) -> Result<ContainerId> {
        self.container
            .lock()
            .expect("container lock poisoned")
            .clone()
            .ok_or(InfraError::NotStarted)
    }

    async fn stop_and_remove(&self, id: &ContainerId) {
        let stop = StopContainerOptions { t: 10 };
        if let Err(e) = self.client.stop_container(&id.0, Some(stop)).await {
            tracing::warn!("Failed to stop container {}: {}", id.short(), e);
        }
        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_container(&id.0, Some(remove)).await {
            tracing::warn!("Failed to remove container {}: {}", id.short(), e);
        }
    }
}

#[async_trait]
impl ContainerAdapter for DockerAdapter {
    async fn build_image(&self, dockerfile: &str) -> Result<ImageId> {
        let dockerfile_path = self.project_path.join(DOCKERFILE_NAME);
        std::fs::write(&dockerfile_path, dockerfile)?;

        let tar_data = create_build_context(&self.project_path)?;

        let options = BuildImageOptions {
            dockerfile: DOCKERFILE_NAME.to_string(),
            t: self.tag.clone(),
            ..Default::default()
        };

        tracing::info!("Building image {}", self.tag);
        let mut stream = self
            .client
            .build_image(options, None, Some(tar_data.into()));

        let mut image_id = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    if let Some(error) = output.error {
                        return Err(InfraError::BuildError(error));
                    }
                    if let Some(aux) = output.aux {
                        if let Some(id) = aux.id {
                            image_id = Some(id);
                        }
                    }
                    if let Some(line) = output.stream {
                        tracing::debug!("{}", line.trim());
                    }
                }
                Err(e) => return Err(InfraError::BuildError(e.to_string())),
            }
        }

        match image_id {
            Some(id) => Ok(ImageId::new(id)),
            None => {
                // Some daemons omit the aux record; fall back to inspect.
                let inspect = self
                    .client
                    .inspect_image(&self.tag)
                    .await
                    .map_err(|e| InfraError::BuildError(e.to_string()))?;
                Ok(ImageId::new(inspect.id.unwrap_or_else(|| self.tag.clone())))
            }
        }
    }

    async fn start(&self, bind_host_project: bool) -> Result<ContainerId> {
        tracing::info!("Starting container from image {}", self.tag);

        let mut binds = vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()];
        if bind_host_project {
            binds.push(format!(
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

        let host_config = HostConfig {
            network_mode: Some("host".to_string()),
            binds: Some(binds),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.tag.clone()),
            tty: Some(true),
            env: Some(vec![format!("PYTHONPATH={}", self.workdir)]),
            working_dir: Some(self.workdir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let id = ContainerId::new(response.id);

        self.client
            .start_container(&id.0, None::<StartContainerOptions<String>>)
            .await?;

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

        let options = CreateExecOptions {
            cmd: Some(login_shell_argv(cmd, timeout_secs)),
            working_dir: Some(self.workdir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        tracing::debug!("Running command in container: {}", cmd);
        let exec = self.client.create_exec(&id.0, options).await?;

        let start_options = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let result = self.client.start_exec(&exec.id, Some(start_options)).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        // The in-container `timeout` is the real limit; this guard only
        // protects against a stalled API stream.
        let hard_limit = Duration::from_secs(timeout_secs + HARD_LIMIT_GRACE_SECS);
        let drained = tokio::time::timeout(hard_limit, async {
            if let StartExecResults::Attached { mut output, .. } = result {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!("exec output stream stalled, reporting timeout");
            stdout.push_str(&timeout_marker(cmd, timeout_secs));
            return Ok(ExecResult::new(124, stdout, stderr));
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);

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

        let tar_data = create_file_archive(files)?;

        let options = UploadToContainerOptions {
            path: self.workdir.as_str(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&id.0, Some(options), tar_data.into())
            .await?;

        tracing::debug!("Placed {} file(s) in the container", files.len());
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
        let mut files = Vec::new();
        for rel in relative_paths {
            let contents = std::fs::read(self.project_path.join(rel))?;
            files.push(FileEntry::new(rel.clone(), contents));
        }
        self.put_files(&files).await
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
            let parent = host_path
                .parent()
                .ok_or_else(|| InfraError::RuntimeError(format!("bad path: {}", rel)))?;
            std::fs::create_dir_all(parent)?;

            let options = DownloadFromContainerOptions {
                path: container_path,
            };
            let mut stream = self.client.download_from_container(&id.0, Some(options));
            let mut tar_data = Vec::new();
            while let Some(chunk) = stream.next().await {
                tar_data.extend_from_slice(&chunk?);
            }
            let mut archive = tar::Archive::new(tar_data.as_slice());
            archive.unpack(parent)?;

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
            let options = RemoveImageOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = self.client.remove_image(&self.tag, Some(options), None).await {
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
            backend: AdapterBackend::DockerApi,
            image_tag: self.tag.clone(),
            workdir: self.workdir.clone(),
        }
    }
}

/// Create a tar archive of the build context.
fn create_build_context(context: &Path) -> Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);
        builder.append_dir_all(".", context)?;
        builder.finish()?;
    }
    Ok(tar_data)
}

/// Create a tar archive holding the given in-memory files.
fn create_file_archive(files: &[FileEntry]) -> Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);
        for file in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(file.contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, &file.path, file.contents.as_slice())?;
        }
        builder.finish()?;
    }
    Ok(tar_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_archive_round_trip() {
        let files = vec![
            FileEntry::text("setup.sh", "#!/bin/bash\necho hi\n"),
            FileEntry::text("scripts/check.sh", "#!/bin/bash\nexit 0\n"),
        ];
        let data = create_file_archive(&files).unwrap();

        let mut archive = tar::Archive::new(data.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["setup.sh", "scripts/check.sh"]);
    }

    #[test]
    fn test_build_context_includes_dockerfile() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(DOCKERFILE_NAME), "FROM ubuntu:22.04\n").unwrap();
        std::fs::write(tmp.path().join("setup.sh"), "#!/bin/bash\n").unwrap();

        let data = create_build_context(tmp.path()).unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("envloop.Dockerfile")));
        assert!(names.iter().any(|n| n.contains("setup.sh")));
    }
}
