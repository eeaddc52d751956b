//! Shell wrapping shared by the adapter backends
//!
//! Commands run under a login shell so shell init files (virtualenv
//! activation etc.) load, and under `timeout` so a hung command cannot
//! stall the loop.

/// Wrap a command so it runs under `timeout` inside a login shell.
///
/// `timeout -k 5` sends SIGKILL five seconds after SIGTERM, yielding exit
/// code 124 (or 137 after the kill).
pub(crate) fn login_shell_argv(cmd: &str, timeout_secs: u64) -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-lc".to_string(),
        format!("timeout -k 5 {}s {}", timeout_secs, cmd),
    ]
}

/// Marker appended to stdout when a command hits its timeout.
pub(crate) fn timeout_marker(cmd: &str, timeout_secs: u64) -> String {
    format!(
        "\n*******************************************************************************\n\
         {} timeout after {} seconds\n\
         *******************************************************************************\n",
        cmd, timeout_secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_shell_argv_shape() {
        let argv = login_shell_argv("make check", 120);
        assert_eq!(argv[0], "/bin/bash");
        assert_eq!(argv[1], "-lc");
        assert_eq!(argv[2], "timeout -k 5 120s make check");
    }

    #[test]
    fn test_timeout_marker_mentions_command() {
        let marker = timeout_marker("pytest -q", 30);
        assert!(marker.contains("pytest -q timeout after 30 seconds"));
    }
}
