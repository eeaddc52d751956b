//! End-to-end loop tests through the CLI building blocks.
//!
//! The collaborator is a real subprocess (a shell script emitting JSON)
//! driven through `CommandLlm`; only the container is mocked.

use envloop_cli::{handoff, llm_bridge::CommandLlm};
use envloop_config::RunConfig;
use envloop_core::test_support::MockAdapter;
use envloop_core::{Orchestrator, Termination};
use std::path::Path;
use std::sync::Arc;

/// A stateful fake collaborator: normalization echoes a fixed catalog,
/// analysis returns a rewrite, and selection answers "make" first and
/// "./server" afterwards (tracked in a counter file).
fn write_collaborator(dir: &Path) -> String {
    let counter = dir.join("select_count");
    let script = format!(
        r##"#!/bin/bash
cat > /dev/null
case "$1" in
  normalize)
    echo '{{"catalog": {{"build": ["make"], "level1": ["./server"]}}, "reasoning": "kept both"}}'
    ;;
  analyze)
    echo '{{"analysis": "cv2 missing from the venv", "patch": {{"kind": "rewrite", "body": "#!/bin/bash\nset -e\n/app/.venv/bin/python -m pip install opencv-python\n"}}}}'
    ;;
  select)
    COUNT_FILE="{counter}"
    N=$(cat "$COUNT_FILE" 2>/dev/null || echo 0)
    echo $((N + 1)) > "$COUNT_FILE"
    if [ "$N" -eq 0 ]; then
      echo '{{"command": "make", "level": "build", "reasoning": "build first"}}'
    else
      echo '{{"command": "./server", "level": "level1", "reasoning": "entry is the target"}}'
    fi
    ;;
esac
"##,
        counter = counter.display()
    );

    let path = dir.join("collaborator.sh");
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_full_loop_with_subprocess_collaborator() {
    let tmp = tempfile::tempdir().unwrap();
    let project = tmp.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(
        project.join("envloop_setup.sh"),
        "#!/bin/bash\nset -e\necho setup\n",
    )
    .unwrap();
    std::fs::write(
        project.join("catalog.json"),
        r#"{"build": ["make"], "level1": ["./server"]}"#,
    )
    .unwrap();

    let program = write_collaborator(tmp.path());
    let config = RunConfig::default();

    let installer = handoff::load_installer(&project, "envloop_setup.sh", &config.workdir).unwrap();
    let catalog = handoff::load_catalog(&project.join("catalog.json")).unwrap();

    let adapter = MockAdapter::new();
    adapter.push_exec(1, "ModuleNotFoundError: No module named 'cv2'"); // installer fails
    adapter.push_exec(0, "installed"); // rewritten installer passes
    adapter.push_exec(0, "built"); // make
    adapter.push_exec(0, "listening"); // ./server

    let orchestrator = Orchestrator::new(
        Arc::new(adapter.clone()),
        Arc::new(CommandLlm::new(program)),
        None,
        config,
        &project,
    );

    let report = orchestrator.run(installer, catalog).await.unwrap();
    assert_eq!(report.termination, Termination::Success);
    assert_eq!(report.exit_code, 0);
    assert!(report
        .final_installer
        .file_content
        .as_ref()
        .unwrap()
        .contains("opencv-python"));

    let cmds = adapter.exec_cmds();
    assert_eq!(cmds.len(), 4);
    assert_eq!(cmds[2], "make");
    assert_eq!(cmds[3], "./server");

    // the rewritten script was persisted next to the original
    let rewritten = std::fs::read_to_string(project.join("envloop_setup.sh")).unwrap();
    assert!(rewritten.contains("opencv-python"));
}
