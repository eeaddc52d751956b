//! End-to-end loop tests backed by MockAdapter and ScriptedLlm.
//!
//! No container runtime or reasoning engine is involved; the adapter
//! serves queued exec results and the collaborator serves queued
//! structured outputs.

use envloop_core::test_support::{MockAdapter, ScriptedLlm};
use envloop_core::{
    Analysis, CommandRecord, ContextAssembler, ErrorAnalyzer, LoopState, Orchestrator, Patch,
    RepairStateMachine, ScriptStore, Termination, TestCatalog, TestLevel, TestPlanner,
    TestSelection, VerificationExecutor,
};
use envloop_config::{PatchStrategy, RunConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn installer() -> CommandRecord {
    CommandRecord::script("bash /app/envloop_setup.sh", "#!/bin/bash\nset -e\necho setup\n")
}

fn basic_catalog() -> TestCatalog {
    TestCatalog {
        build: vec!["make".into()],
        level1: vec!["./server".into()],
        ..Default::default()
    }
}

fn select(command: &str, level: TestLevel) -> TestSelection {
    TestSelection {
        command: command.into(),
        level,
        reasoning: "scripted".into(),
    }
}

fn orchestrator(
    adapter: &MockAdapter,
    llm: &ScriptedLlm,
    config: RunConfig,
    project_dir: &std::path::Path,
) -> Orchestrator {
    Orchestrator::new(
        Arc::new(adapter.clone()),
        Arc::new(llm.clone()),
        None,
        config,
        project_dir,
    )
}

#[tokio::test]
async fn test_scenario_happy_path() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    adapter.push_exec(0, "setup done"); // installer
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built"); // make
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "listening"); // ./server

    let orchestrator = orchestrator(&adapter, &llm, RunConfig::default(), tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Success);
    assert_eq!(report.exit_code, 0);
    assert!(report.failing_commands.is_empty());

    let cmds = adapter.exec_cmds();
    assert_eq!(
        cmds,
        vec!["bash /app/envloop_setup.sh", "make", "./server"]
    );

    // the snapshot on disk reflects the final state
    let snapshot: LoopState =
        serde_json::from_str(&std::fs::read_to_string(&report.snapshot_path).unwrap()).unwrap();
    assert_eq!(snapshot.installer_history.len(), 1);
    assert_eq!(snapshot.test_history.len(), 2);
    assert!(snapshot
        .test_history
        .iter()
        .all(|entry| entry.result.exit_code == 0));
}

#[tokio::test]
async fn test_scenario_rewrite_fixes_missing_module() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    adapter.push_exec(1, "ModuleNotFoundError: No module named 'cv2'");
    llm.push_analysis(Analysis {
        analysis: "cv2 is not installed in the project virtualenv".into(),
        patch: Patch::Rewrite {
            body: "#!/bin/bash\nset -e\n/app/.venv/bin/python -m pip install opencv-python\n"
                .into(),
        },
    });
    adapter.push_exec(0, "installed"); // second installer run
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built");
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "listening");

    let orchestrator = orchestrator(&adapter, &llm, RunConfig::default(), tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Success);
    assert!(report
        .final_installer
        .file_content
        .as_ref()
        .unwrap()
        .contains("opencv-python"));

    // exactly one rewrite round consumed
    let snapshot: LoopState =
        serde_json::from_str(&std::fs::read_to_string(&report.snapshot_path).unwrap()).unwrap();
    assert_eq!(
        snapshot.budget.rewrite_rounds_left,
        RunConfig::default().budget.rewrite_rounds - 1
    );
    assert_eq!(snapshot.installer_history.len(), 2);
    // the failing round carries the analysis it triggered
    assert!(snapshot.installer_history[0]
        .analysis
        .as_ref()
        .unwrap()
        .contains("virtualenv"));

    // the rewritten script landed on the host and in the container
    let store = ScriptStore::new(tmp.path());
    assert!(store
        .load("envloop_setup.sh")
        .unwrap()
        .contains("opencv-python"));
    assert!(adapter.put_paths().contains(&"envloop_setup.sh".to_string()));
}

#[tokio::test]
async fn test_scenario_funnel_short_circuit() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    let catalog = TestCatalog {
        build: vec!["make".into()],
        level1: vec!["./server".into()],
        level2: vec!["pytest --integration".into()],
        level3: vec!["tool --version".into()],
        level4: vec!["pytest -q".into()],
    };

    adapter.push_exec(0, "setup");
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built");
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "listening");

    let orchestrator = orchestrator(&adapter, &llm, RunConfig::default(), tmp.path());
    let report = orchestrator.run(installer(), catalog).await.unwrap();

    assert_eq!(report.termination, Termination::Success);

    // entry succeeded on the first try: integration and unit never ran
    let cmds = adapter.exec_cmds();
    assert!(!cmds.iter().any(|c| c.contains("pytest")));
    assert_eq!(cmds.last().unwrap(), "./server");
}

#[tokio::test]
async fn test_scenario_budget_exhaustion() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    let mut config = RunConfig::default();
    config.patch_strategy = PatchStrategy::SingleCommand;
    config.budget.rewrite_rounds = 2;

    adapter.push_exec(1, "error: libfoo not found");
    llm.push_analysis(Analysis {
        analysis: "libfoo missing".into(),
        patch: Patch::SingleCommand {
            text: "apt-get install -y libfoo".into(),
        },
    });
    adapter.push_exec(1, "E: Unable to locate package libfoo");
    llm.push_analysis(Analysis {
        analysis: "package name differs".into(),
        patch: Patch::SingleCommand {
            text: "apt-get install -y libfoo-dev".into(),
        },
    });
    adapter.push_exec(1, "E: Unable to locate package libfoo-dev");

    let orchestrator = orchestrator(&adapter, &llm, config, tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Exhausted);
    assert_eq!(report.exit_code, 2);
    assert!(!report.failing_commands.is_empty());

    // final state snapshot present on disk with the rewrite budget at zero
    let snapshot: LoopState =
        serde_json::from_str(&std::fs::read_to_string(&report.snapshot_path).unwrap()).unwrap();
    assert_eq!(snapshot.budget.rewrite_rounds_left, 0);
}

#[tokio::test]
async fn test_single_command_strategy_replaces_installer_stream() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    let mut config = RunConfig::default();
    config.patch_strategy = PatchStrategy::SingleCommand;

    adapter.push_exec(1, "ModuleNotFoundError: No module named 'yaml'");
    llm.push_analysis(Analysis {
        analysis: "yaml missing".into(),
        patch: Patch::SingleCommand {
            text: "/app/.venv/bin/python -m pip install pyyaml".into(),
        },
    });
    adapter.push_exec(0, "installed");
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built");
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "listening");

    let orchestrator = orchestrator(&adapter, &llm, config, tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Success);
    assert_eq!(
        report.final_installer.invocation,
        "/app/.venv/bin/python -m pip install pyyaml"
    );
    assert!(report.final_installer.file_content.is_none());
}

#[tokio::test]
async fn test_snapshot_truncates_to_analyzer_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    let mut config = RunConfig::default();
    config.stdout_truncate_chars = 200;
    config.budget.rewrite_rounds = 1;
    config.patch_strategy = PatchStrategy::SingleCommand;

    adapter.push_exec(1, "x".repeat(10_000));
    llm.push_analysis(Analysis {
        analysis: "huge output".into(),
        patch: Patch::SingleCommand {
            text: "true".into(),
        },
    });
    adapter.push_exec(1, "y".repeat(10_000));

    let orchestrator = orchestrator(&adapter, &llm, config, tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Exhausted);
    let snapshot: LoopState =
        serde_json::from_str(&std::fs::read_to_string(&report.snapshot_path).unwrap()).unwrap();
    for entry in &snapshot.installer_history {
        assert!(entry.result.stdout.len() <= 200);
    }
}

// ---- stepwise machine tests ----

fn machine_parts(
    adapter: &MockAdapter,
    llm: &ScriptedLlm,
    config: &RunConfig,
    project_dir: &std::path::Path,
    stop: Arc<AtomicBool>,
) -> RepairStateMachine {
    let assembler = ContextAssembler::new(config.history_window, config.stdout_truncate_chars);
    let adapter: Arc<dyn envloop_adapter::ContainerAdapter> = Arc::new(adapter.clone());
    let llm: Arc<dyn envloop_core::LanguageModel> = Arc::new(llm.clone());
    RepairStateMachine::new(
        adapter.clone(),
        ErrorAnalyzer::new(llm.clone(), assembler.clone(), config.patch_strategy),
        TestPlanner::new(llm, None, assembler),
        VerificationExecutor::new(config.mode, adapter, config.timeout),
        ScriptStore::new(project_dir),
        config.clone(),
        stop,
    )
}

#[tokio::test]
async fn test_histories_grow_at_most_one_entry_per_tick() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    adapter.push_exec(1, "broken");
    llm.push_analysis(Analysis {
        analysis: "first failure".into(),
        patch: Patch::Rewrite {
            body: "#!/bin/bash\nset -e\napt-get install -y build-essential\n".into(),
        },
    });
    adapter.push_exec(0, "fixed");
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built");
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "listening");

    let config = RunConfig::default();
    let machine = machine_parts(
        &adapter,
        &llm,
        &config,
        tmp.path(),
        Arc::new(AtomicBool::new(false)),
    );
    let mut state = LoopState::new(
        installer(),
        basic_catalog(),
        envloop_core::Budget::from_config(&config.budget),
    );

    let mut previous_total = 0usize;
    let mut previous_budget = state.budget;
    loop {
        let outcome = machine.tick(&mut state).await.unwrap();

        let total = state.installer_history.len() + state.test_history.len();
        assert!(total <= previous_total + 1, "histories grew by more than one");
        previous_total = total;

        // budgets only go down
        assert!(state.budget.global_ticks_left <= previous_budget.global_ticks_left);
        assert!(state.budget.rewrite_rounds_left <= previous_budget.rewrite_rounds_left);
        assert!(state.budget.test_rounds_left <= previous_budget.test_rounds_left);
        previous_budget = state.budget;

        if let Some(termination) = outcome {
            assert_eq!(termination, Termination::Success);
            break;
        }
    }
}

#[tokio::test]
async fn test_success_keeps_last_passing_installer() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    adapter.push_exec(1, "broken");
    let fixed_body = "#!/bin/bash\nset -e\necho fixed\n";
    llm.push_analysis(Analysis {
        analysis: "fixable".into(),
        patch: Patch::Rewrite {
            body: fixed_body.into(),
        },
    });
    adapter.push_exec(0, "ok");
    llm.push_selection(select("make", TestLevel::Build));
    adapter.push_exec(0, "built");
    llm.push_selection(select("./server", TestLevel::Entry));
    adapter.push_exec(0, "up");

    let orchestrator = orchestrator(&adapter, &llm, RunConfig::default(), tmp.path());
    let report = orchestrator
        .run(installer(), basic_catalog())
        .await
        .unwrap();

    assert_eq!(report.termination, Termination::Success);

    // the final installer is exactly the body of the last passing round
    let snapshot: LoopState =
        serde_json::from_str(&std::fs::read_to_string(&report.snapshot_path).unwrap()).unwrap();
    let last_passing = snapshot
        .installer_history
        .iter()
        .rev()
        .find(|entry| entry.result.exit_code == 0)
        .unwrap();
    assert_eq!(last_passing.command, snapshot.current_installer);
    assert_eq!(
        snapshot.current_installer.file_content.as_deref(),
        Some(fixed_body)
    );
}

#[tokio::test]
async fn test_cancellation_flag_stops_the_loop() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    let config = RunConfig::default();
    let stop = Arc::new(AtomicBool::new(false));
    let machine = machine_parts(&adapter, &llm, &config, tmp.path(), stop.clone());
    let mut state = LoopState::new(
        installer(),
        basic_catalog(),
        envloop_core::Budget::from_config(&config.budget),
    );

    stop.store(true, Ordering::Relaxed);
    let outcome = machine.tick(&mut state).await.unwrap();
    assert_eq!(outcome, Some(Termination::Cancelled));
    // nothing executed, state untouched
    assert!(adapter.exec_cmds().is_empty());
    assert_eq!(state.tick, 0);
}

#[tokio::test]
async fn test_llm_failure_retries_then_costs_a_rewrite_round() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = MockAdapter::new();
    let llm = ScriptedLlm::new();

    // installer fails; no scripted analysis at all, so both the call and
    // its retry fail
    adapter.push_exec(1, "broken");

    let config = RunConfig::default();
    let machine = machine_parts(
        &adapter,
        &llm,
        &config,
        tmp.path(),
        Arc::new(AtomicBool::new(false)),
    );
    let mut state = LoopState::new(
        installer(),
        basic_catalog(),
        envloop_core::Budget::from_config(&config.budget),
    );

    machine.tick(&mut state).await.unwrap(); // execute installer
    let rewrites_before = state.budget.rewrite_rounds_left;
    machine.tick(&mut state).await.unwrap(); // analyzer fails twice

    assert_eq!(state.budget.rewrite_rounds_left, rewrites_before - 1);
    // two prompts: the original call and its retry
    assert_eq!(llm.prompts().len(), 2);
    // the installer is unchanged and will be re-analyzed next tick
    assert!(state.error_analysis.contains("failed twice"));
}

#[tokio::test]
async fn test_exec_timeout_zero_is_rejected() {
    let adapter = MockAdapter::new();
    let result = envloop_adapter::ContainerAdapter::exec(&adapter, "true", 0).await;
    assert!(matches!(
        result,
        Err(envloop_adapter::InfraError::InvalidTimeout)
    ));
    assert!(adapter.exec_cmds().is_empty());
}
