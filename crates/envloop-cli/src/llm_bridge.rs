//! Collaborator bridge
//!
//! The reasoning engine lives outside this binary. The bridge spawns a
//! user-provided program per call: the task name and patch strategy go in
//! argv, the prompt on stdin, and the structured response comes back as
//! JSON on stdout.

use async_trait::async_trait;
use envloop_core::{Analysis, CoreError, LanguageModel, NormalizedCatalog, TestSelection};
use envloop_config::PatchStrategy;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A `LanguageModel` backed by an external command.
pub struct CommandLlm {
    program: String,
}

impl CommandLlm {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn invoke(&self, args: &[&str], prompt: &str) -> Result<String, CoreError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Llm(format!("spawning {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Llm("collaborator stdin unavailable".to_string()))?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .map_err(|e| CoreError::Llm(format!("writing prompt: {}", e)))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoreError::Llm(format!("waiting for collaborator: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Llm(format!(
                "collaborator exited {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl LanguageModel for CommandLlm {
    async fn analyze_and_patch(
        &self,
        prompt: &str,
        strategy: PatchStrategy,
    ) -> envloop_core::Result<Analysis> {
        let strategy_arg = strategy.to_string();
        let stdout = self.invoke(&["analyze", &strategy_arg], prompt).await?;
        let analysis: Analysis = serde_json::from_str(&stdout)
            .map_err(|e| CoreError::Llm(format!("malformed analyze output: {}", e)))?;
        Ok(analysis)
    }

    async fn select_test(&self, prompt: &str) -> envloop_core::Result<TestSelection> {
        let stdout = self.invoke(&["select"], prompt).await?;
        let selection: TestSelection = serde_json::from_str(&stdout)
            .map_err(|e| CoreError::Llm(format!("malformed select output: {}", e)))?;
        Ok(selection)
    }

    async fn normalize_catalog(&self, prompt: &str) -> envloop_core::Result<NormalizedCatalog> {
        let stdout = self.invoke(&["normalize"], prompt).await?;
        let normalized: NormalizedCatalog = serde_json::from_str(&stdout)
            .map_err(|e| CoreError::Llm(format!("malformed normalize output: {}", e)))?;
        Ok(normalized)
    }
}
