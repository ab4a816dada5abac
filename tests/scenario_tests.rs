//! Scenario execution tests for Broker
//!
//! Each test writes a scenario into a temporary broker directory and runs
//! it end to end against the test provider and a recording transport:
//! - Checkout, session and checkin steps
//! - Guards, loops, captures and recovery
//! - Exit codes and nested scenarios
//! - Discovery, validation and info

mod common;

use std::sync::Arc;

use broker::scenario::{
    list_scenarios, scenario_info, validate_scenario, RunnerOptions, ScenarioOutcome,
    ScenarioRunner, StepMemory, StepStatus,
};
use common::*;
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

fn options(sessions: &RecordingSessions) -> RunnerOptions {
    RunnerOptions {
        sessions: Some(Arc::new(sessions.clone())),
        ..RunnerOptions::default()
    }
}

async fn run(env: &TestEnv, name: &str, yaml: &str, options: RunnerOptions) -> ScenarioOutcome {
    let path = env.write_scenario(name, yaml);
    let mut runner = ScenarioRunner::new(path, Arc::clone(&env.config), options).unwrap();
    runner.run().await.unwrap()
}

fn step<'a>(outcome: &'a ScenarioOutcome, name: &str) -> &'a StepMemory {
    outcome
        .steps
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("no step named {name}"))
}

// ============================================================================
// Lifecycle Through Scenarios
// ============================================================================

#[tokio::test]
async fn test_checkout_ssh_checkin() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let yaml = r#"
variables:
  COUNT: 2
steps:
  - name: Provision
    action: checkout
    arguments:
      count: "{{ COUNT }}"
  - name: Smoke test
    action: ssh
    with:
      hosts: scenario_inventory
    arguments:
      command: echo ok
  - name: Release
    action: checkin
"#;
    let outcome = run(&env, "smoke", yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.message);
    assert!(outcome.success());
    assert!(outcome.hosts.is_empty());

    let commands = sessions.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands.iter().all(|(_, command)| command == "echo ok"));

    let smoke = step(&outcome, "Smoke test");
    assert_eq!(smoke.status, StepStatus::Completed);
    let results = smoke.output.as_object().unwrap();
    assert_eq!(results.len(), 2);
    for result in results.values() {
        assert_eq!(result["status"], json!(0));
        assert_eq!(result["stdout"], json!("ran: echo ok"));
    }

    assert!(env.stored_hosts().is_empty());
}

#[tokio::test]
async fn test_scenario_inventory_file_tracks_hosts() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let inventory = env.path().join("held.yaml");
    let yaml = format!(
        r#"
config:
  inventory_path: {}
  settings:
    providers:
      TestProvider:
        prefix: ci
steps:
  - name: Provision
    action: checkout
    arguments:
      count: 2
"#,
        inventory.display()
    );
    let outcome = run(&env, "hold", &yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.hosts.len(), 2);
    assert!(outcome.hosts.iter().all(|h| h.identity().starts_with("ci-")));

    let held: Vec<broker::inventory::HostRecord> =
        serde_yaml::from_str(&std::fs::read_to_string(&inventory).unwrap()).unwrap();
    assert_eq!(held.len(), 2);
}

#[tokio::test]
async fn test_cli_vars_override_declared_variables() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let mut opts = options(&sessions);
    opts.cli_vars = IndexMap::from([("COUNT".to_string(), "3".to_string())]);
    let yaml = r#"
variables:
  COUNT: 1
steps:
  - name: Provision
    action: checkout
    arguments:
      count: "{{ COUNT }}"
"#;
    let outcome = run(&env, "vars", yaml, opts).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.hosts.len(), 3);
}

// ============================================================================
// Flow Control
// ============================================================================

#[tokio::test]
async fn test_when_false_skips_step() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let yaml = r#"
variables:
  PROVISION: false
steps:
  - name: Provision
    action: checkout
    when: PROVISION
  - name: Done
    action: exit
"#;
    let outcome = run(&env, "guarded", yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(step(&outcome, "Provision").status, StepStatus::Skipped);
    assert_eq!(step(&outcome, "Done").status, StepStatus::Completed);
    assert!(env.stored_hosts().is_empty());
}

#[tokio::test]
async fn test_loop_continues_past_failed_iteration() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let yaml = r#"
variables:
  REQUESTS:
    - {fail: false}
    - {fail: true}
    - {fail: false}
steps:
  - name: Each
    action: checkout
    loop:
      iterable: REQUESTS
      iter_var: request
      on_error: continue
    arguments:
      fail: "{{ request.fail }}"
    capture:
      as: results
"#;
    let path = env.write_scenario("looped", yaml);
    let mut runner =
        ScenarioRunner::new(path, Arc::clone(&env.config), options(&sessions)).unwrap();
    let outcome = runner.run().await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    let each = step(&outcome, "Each");
    assert_eq!(each.status, StepStatus::Completed);
    assert_eq!(each.output["1"]["status"], json!("failed"));
    assert_eq!(each.output["0"].as_array().map(Vec::len), Some(1));
    assert_eq!(each.output["2"].as_array().map(Vec::len), Some(1));

    assert_eq!(runner.variables()["results"], each.output);
    assert_eq!(outcome.hosts.len(), 2);
}

#[tokio::test]
async fn test_capture_transform_and_output_file() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let report = env.path().join("report.txt");
    let yaml = format!(
        r#"
steps:
  - name: Provision
    action: checkout
  - name: Read kernel
    action: ssh
    with:
      hosts: scenario_inventory[0]
    arguments:
      command: uname -r
    capture:
      as: kernel
      transform: "{{{{ step.output.stdout }}}}"
  - name: Report
    action: output
    arguments:
      content: kernel
      destination: {}
  - name: Release
    action: checkin
"#,
        report.display()
    );
    let outcome = run(&env, "capture", &yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0, "{:?}", outcome.message);
    assert_eq!(
        std::fs::read_to_string(&report).unwrap().trim(),
        "ran: uname -r"
    );
}

#[tokio::test]
async fn test_failed_step_runs_recovery_then_exit() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let marker = env.path().join("recovered.txt");
    let yaml = format!(
        r#"
steps:
  - name: Broken
    action: ssh
    arguments:
      command: uptime
    on_error:
      - name: Recover
        action: output
        arguments:
          content: recovered
          destination: {}
  - name: Stop
    action: exit
    arguments:
      return_code: 4
      message: stopping early
  - name: Unreached
    action: checkout
"#,
        marker.display()
    );
    let outcome = run(&env, "recovery", &yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 4);
    assert_eq!(outcome.message.as_deref(), Some("stopping early"));
    assert_eq!(step(&outcome, "Broken").status, StepStatus::Failed);
    assert_eq!(step(&outcome, "Recover").status, StepStatus::Completed);
    assert!(outcome.steps.iter().all(|s| s.name != "Unreached"));
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "recovered");
}

#[tokio::test]
async fn test_unhandled_failure_sets_exit_code() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let yaml = r#"
steps:
  - name: No targets
    action: ssh
    arguments:
      command: uptime
  - name: Unreached
    action: exit
"#;
    let outcome = run(&env, "unhandled", yaml, options(&sessions)).await;

    // ssh without any hosts is a selection failure
    assert_eq!(outcome.exit_code, 3);
    assert_eq!(step(&outcome, "No targets").status, StepStatus::Failed);
    assert!(outcome.steps.iter().all(|s| s.name != "Unreached"));
}

#[tokio::test]
async fn test_exit_on_error_false_continues() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let yaml = r#"
steps:
  - name: Refused
    action: checkout
    exit_on_error: false
    arguments:
      fail: true
  - name: Accepted
    action: checkout
"#;
    let outcome = run(&env, "lenient", yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(step(&outcome, "Refused").status, StepStatus::Failed);
    assert_eq!(outcome.hosts.len(), 1);
}

#[tokio::test]
async fn test_unreachable_host_fails_session_step() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    let broker = env.broker();
    let hosts = broker.checkout(args(json!({}))).await.unwrap();
    sessions.set_unreachable(hosts[0].identity());

    let yaml = r#"
steps:
  - name: Check uptime
    action: ssh
    with:
      hosts: inventory
    arguments:
      command: uptime
"#;
    let outcome = run(&env, "unreachable", yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 4);
    assert!(sessions.commands().is_empty());
}

#[tokio::test]
async fn test_run_scenarios_reports_children() {
    let env = TestEnv::new();
    let sessions = RecordingSessions::new();
    env.write_scenario(
        "child_ok",
        "steps:\n  - name: Fine\n    action: exit\n",
    );
    env.write_scenario(
        "child_bad",
        "steps:\n  - name: Bad\n    action: exit\n    arguments: {return_code: 2}\n",
    );
    let yaml = r#"
steps:
  - name: Children
    action: run_scenarios
    arguments:
      paths: [child_ok, child_bad]
"#;
    let outcome = run(&env, "parent", yaml, options(&sessions)).await;

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(
        step(&outcome, "Children").output,
        json!([
            {"path": "child_ok", "success": true},
            {"path": "child_bad", "success": false}
        ])
    );
}

// ============================================================================
// Discovery / Validation
// ============================================================================

#[test]
fn test_list_validate_and_info() {
    let env = TestEnv::new();
    let path = env.write_scenario(
        "described",
        r#"
variables:
  COUNT: 1
steps:
  - name: Provision
    action: checkout
  - name: Release
    action: checkin
"#,
    );
    env.write_scenario(
        "broken",
        "steps:\n  - name: a\n    action: exit\n  - name: a\n    action: exit\n",
    );

    assert_eq!(
        list_scenarios(&env.config.scenarios_directory()).unwrap(),
        vec!["broken", "described"]
    );

    let info = scenario_info(&path).unwrap();
    assert_eq!(info.name, "described");
    assert_eq!(info.steps.len(), 2);
    assert_eq!(info.variables["COUNT"], json!(1));

    assert!(validate_scenario(&path).is_ok());
    let err = validate_scenario(&env.config.scenarios_directory().join("broken.yaml")).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_unknown_action_is_rejected() {
    let env = TestEnv::new();
    let path = env.write_scenario(
        "typo",
        "steps:\n  - name: a\n    action: reboot_everything\n",
    );
    let err = ScenarioRunner::new(path, Arc::clone(&env.config), RunnerOptions::default())
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
