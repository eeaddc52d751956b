//! Test support utilities for envloop-core
//!
//! Provides MockAdapter and ScriptedLlm for exercising the loop without a
//! container runtime or a reasoning engine.

use crate::llm::{Analysis, LanguageModel, NormalizedCatalog, Retrieval, TestSelection};
use crate::{CoreError, Result};
use async_trait::async_trait;
use envloop_adapter::{
    AdapterBackend, AdapterInfo, ContainerAdapter, ContainerId, ExecResult, FileEntry, ImageId,
    InfraError,
};
use envloop_config::PatchStrategy;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Records which methods were called on the mock adapter
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    BuildImage,
    Start { bind: bool },
    Restart { bind: bool },
    Exec { cmd: String, timeout_secs: u64 },
    PutFiles { paths: Vec<String> },
    RemoveFiles { paths: Vec<String> },
    MkdirP { paths: Vec<String> },
    ReadFile { path: String },
    CopyHostToContainer,
    CopyContainerToHost { pattern: String },
    Cleanup,
}

/// Configurable mock container adapter.
///
/// Exec responses come from a per-call queue of `(exit_code, stdout)`
/// pairs; when the queue is empty every exec succeeds with empty output.
#[derive(Clone)]
pub struct MockAdapter {
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    exec_responses: Arc<Mutex<VecDeque<(i64, String)>>>,
    workdir: String,
    project_path: PathBuf,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            exec_responses: Arc::new(Mutex::new(VecDeque::new())),
            workdir: "/app".to_string(),
            project_path: PathBuf::from("/tmp/envloop-mock-project"),
        }
    }

    /// Queue the next exec response.
    pub fn push_exec(&self, exit_code: i64, stdout: impl Into<String>) {
        self.exec_responses
            .lock()
            .expect("lock poisoned")
            .push_back((exit_code, stdout.into()));
    }

    /// Commands passed to exec, in order.
    pub fn exec_cmds(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(|call| match call {
                MockCall::Exec { cmd, .. } => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    /// Paths put into the container, in order.
    pub fn put_paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(|call| match call {
                MockCall::PutFiles { paths } => Some(paths.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().expect("lock poisoned").push(call);
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerAdapter for MockAdapter {
    async fn build_image(&self, _dockerfile: &str) -> envloop_adapter::Result<ImageId> {
        self.record(MockCall::BuildImage);
        Ok(ImageId::new("sha256:mock"))
    }

    async fn start(&self, bind_host_project: bool) -> envloop_adapter::Result<ContainerId> {
        self.record(MockCall::Start {
            bind: bind_host_project,
        });
        Ok(ContainerId::new("mock-container"))
    }

    async fn restart(&self, bind_host_project: bool) -> envloop_adapter::Result<ContainerId> {
        self.record(MockCall::Restart {
            bind: bind_host_project,
        });
        Ok(ContainerId::new("mock-container"))
    }

    async fn exec(&self, cmd: &str, timeout_secs: u64) -> envloop_adapter::Result<ExecResult> {
        if timeout_secs == 0 {
            return Err(InfraError::InvalidTimeout);
        }
        self.record(MockCall::Exec {
            cmd: cmd.to_string(),
            timeout_secs,
        });
        let (exit_code, stdout) = self
            .exec_responses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or((0, String::new()));
        Ok(ExecResult::new(exit_code, stdout, ""))
    }

    async fn put_files(&self, files: &[FileEntry]) -> envloop_adapter::Result<()> {
        self.record(MockCall::PutFiles {
            paths: files.iter().map(|f| f.path.clone()).collect(),
        });
        Ok(())
    }

    async fn remove_files(&self, paths: &[String]) -> envloop_adapter::Result<()> {
        self.record(MockCall::RemoveFiles {
            paths: paths.to_vec(),
        });
        Ok(())
    }

    async fn mkdir_p(&self, paths: &[String]) -> envloop_adapter::Result<()> {
        self.record(MockCall::MkdirP {
            paths: paths.to_vec(),
        });
        Ok(())
    }

    async fn read_file(&self, path: &str, _max_lines: usize) -> envloop_adapter::Result<String> {
        self.record(MockCall::ReadFile {
            path: path.to_string(),
        });
        Ok(String::new())
    }

    async fn copy_host_to_container(
        &self,
        _relative_paths: &[String],
    ) -> envloop_adapter::Result<()> {
        self.record(MockCall::CopyHostToContainer);
        Ok(())
    }

    async fn copy_container_to_host(
        &self,
        pattern: &str,
    ) -> envloop_adapter::Result<Vec<PathBuf>> {
        self.record(MockCall::CopyContainerToHost {
            pattern: pattern.to_string(),
        });
        Ok(Vec::new())
    }

    async fn cleanup(&self) -> envloop_adapter::Result<()> {
        self.record(MockCall::Cleanup);
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
            image_tag: "envloop-mock".to_string(),
            workdir: self.workdir.clone(),
        }
    }
}

/// Scripted language-model collaborator.
///
/// Responses are queues drained per call; every prompt is recorded.
/// Analysis and selection calls fail with `CoreError::Llm` once their
/// queue is empty, so a test sees exactly the calls it scripted. The
/// normalization queue falls back to an empty catalog, which the planner
/// treats as "keep the prefiltered input".
#[derive(Clone)]
pub struct ScriptedLlm {
    analyses: Arc<Mutex<VecDeque<Analysis>>>,
    selections: Arc<Mutex<VecDeque<TestSelection>>>,
    catalogs: Arc<Mutex<VecDeque<NormalizedCatalog>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            analyses: Arc::new(Mutex::new(VecDeque::new())),
            selections: Arc::new(Mutex::new(VecDeque::new())),
            catalogs: Arc::new(Mutex::new(VecDeque::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push_analysis(&self, analysis: Analysis) {
        self.analyses
            .lock()
            .expect("lock poisoned")
            .push_back(analysis);
    }

    pub fn push_selection(&self, selection: TestSelection) {
        self.selections
            .lock()
            .expect("lock poisoned")
            .push_back(selection);
    }

    pub fn push_catalog(&self, catalog: NormalizedCatalog) {
        self.catalogs
            .lock()
            .expect("lock poisoned")
            .push_back(catalog);
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("lock poisoned").clone()
    }

    fn record_prompt(&self, prompt: &str) {
        self.prompts
            .lock()
            .expect("lock poisoned")
            .push(prompt.to_string());
    }
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn analyze_and_patch(
        &self,
        prompt: &str,
        _strategy: PatchStrategy,
    ) -> Result<Analysis> {
        self.record_prompt(prompt);
        self.analyses
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| CoreError::Llm("no scripted analysis left".to_string()))
    }

    async fn select_test(&self, prompt: &str) -> Result<TestSelection> {
        self.record_prompt(prompt);
        self.selections
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| CoreError::Llm("no scripted selection left".to_string()))
    }

    async fn normalize_catalog(&self, prompt: &str) -> Result<NormalizedCatalog> {
        self.record_prompt(prompt);
        Ok(self
            .catalogs
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| NormalizedCatalog {
                catalog: Default::default(),
                reasoning: "passthrough".to_string(),
            }))
    }
}

/// Scripted retrieval collaborator returning fixed chunks.
#[derive(Clone, Default)]
pub struct ScriptedRetrieval {
    pub chunks: Vec<String>,
}

#[async_trait]
impl Retrieval for ScriptedRetrieval {
    async fn search(&self, _query: &str) -> Result<Vec<String>> {
        Ok(self.chunks.clone())
    }
}
