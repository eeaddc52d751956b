//! Common types for container adapters

use serde::{Deserialize, Serialize};

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Image ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adapter backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterBackend {
    /// Shells out to the `docker` CLI.
    DockerCli,
    /// Talks to the daemon API through bollard.
    DockerApi,
}

impl std::fmt::Display for AdapterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DockerCli => write!(f, "docker_cli"),
            Self::DockerApi => write!(f, "docker_api"),
        }
    }
}

impl std::str::FromStr for AdapterBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker_cli" | "docker-cli" | "cli" => Ok(Self::DockerCli),
            "docker_api" | "docker-api" | "api" => Ok(Self::DockerApi),
            _ => Err(format!("Unknown adapter backend: {}", s)),
        }
    }
}

/// Result of one exec call. Nonzero exit codes are data, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn new(exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the exit code is one of the timeout sentinels.
    pub fn timed_out(&self) -> bool {
        self.exit_code == 124 || self.exit_code == 137
    }
}

/// A file to place in the container, path relative to the workdir.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub contents: Vec<u8>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    pub fn text(path: impl Into<String>, body: &str) -> Self {
        Self::new(path, body.as_bytes().to_vec())
    }
}

/// Adapter information
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub backend: AdapterBackend,
    pub image_tag: String,
    pub workdir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_container_id_short() {
        let id = ContainerId::new("0123456789abcdef0123");
        assert_eq!(id.short(), "0123456789ab");
        let tiny = ContainerId::new("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_backend_round_trip() {
        assert_eq!(
            AdapterBackend::from_str("cli").unwrap(),
            AdapterBackend::DockerCli
        );
        assert_eq!(
            AdapterBackend::from_str("docker_api").unwrap(),
            AdapterBackend::DockerApi
        );
        assert_eq!(AdapterBackend::DockerCli.to_string(), "docker_cli");
        assert!(AdapterBackend::from_str("podman").is_err());
    }

    #[test]
    fn test_exec_result_flags() {
        assert!(ExecResult::new(0, "ok", "").success());
        assert!(!ExecResult::new(1, "", "boom").success());
        assert!(ExecResult::new(124, "", "").timed_out());
        assert!(ExecResult::new(137, "", "").timed_out());
        assert!(!ExecResult::new(2, "", "").timed_out());
    }
}
