//! envloop CLI internals
//!
//! Split out of the binary so the handoff loaders and the collaborator
//! bridge are testable without spawning the executable.

pub mod handoff;
pub mod llm_bridge;
