//! Collaborator interfaces
//!
//! The reasoning engine and the retrieval service are external; only
//! their capabilities appear here. Implementations must return structured
//! output matching these types or fail with `CoreError::Llm`.

use crate::model::{TestCatalog, TestLevel};
use crate::Result;
use async_trait::async_trait;
use envloop_config::PatchStrategy;
use serde::{Deserialize, Serialize};

/// The analyzer's patch: either a whole new installer script or one
/// targeted shell command. Which shape is requested is fixed per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Patch {
    Rewrite { body: String },
    SingleCommand { text: String },
}

impl Patch {
    pub fn matches_strategy(&self, strategy: PatchStrategy) -> bool {
        matches!(
            (self, strategy),
            (Patch::Rewrite { .. }, PatchStrategy::RewriteFull)
                | (Patch::SingleCommand { .. }, PatchStrategy::SingleCommand)
        )
    }
}

/// Structured analyzer output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Human-readable account of the root cause.
    pub analysis: String,
    pub patch: Patch,
}

/// Structured test-selection output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSelection {
    /// The single command to execute next.
    pub command: String,
    pub level: TestLevel,
    pub reasoning: String,
}

/// Structured catalog-normalization output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedCatalog {
    pub catalog: TestCatalog,
    pub reasoning: String,
}

/// The language-model collaborator.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Analyze a failing round and produce a patch of the given shape.
    async fn analyze_and_patch(&self, prompt: &str, strategy: PatchStrategy) -> Result<Analysis>;

    /// Pick the next verification command.
    async fn select_test(&self, prompt: &str) -> Result<TestSelection>;

    /// Clean up and re-bucket the discovered command catalog.
    async fn normalize_catalog(&self, prompt: &str) -> Result<NormalizedCatalog>;
}

/// Optional advisory search used during catalog normalization.
#[async_trait]
pub trait Retrieval: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<String>>;
}
