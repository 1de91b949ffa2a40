#![cfg(unix)]

mod common;

use common::init_tracing;
use dstream::config::{ProviderConfig, TaskConfig, TaskKind};
use dstream::executor::{Command, Executor};
use dstream::error::EXIT_PROVIDER;
use dstream::Error;
use serde_json::{json, Value};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn provider(path: &Path, config: Value) -> Option<ProviderConfig> {
    Some(ProviderConfig {
        provider_path: Some(path.to_path_buf()),
        provider_ref: None,
        config,
    })
}

fn providers_task(input: &Path, output: &Path) -> TaskConfig {
    TaskConfig {
        name: "persons-to-file".into(),
        kind: TaskKind::Providers,
        input: provider(input, json!({"interval": 5})),
        output: provider(output, json!({"path": "out"})),
        plugin_path: None,
        plugin_ref: None,
        config: Value::Null,
    }
}

fn plugin_task(path: &Path, config: Value) -> TaskConfig {
    TaskConfig {
        name: "counter".into(),
        kind: TaskKind::Plugin,
        input: None,
        output: None,
        plugin_path: Some(path.to_path_buf()),
        plugin_ref: None,
        config,
    }
}

fn executor() -> Executor {
    Executor::with_grace(Duration::from_secs(2))
}

fn lines(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn test_records_flow_from_input_to_output() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let seen = dir.path().join("input-envelope");
    let sink = dir.path().join("output.jsonl");
    let input = script(
        dir.path(),
        "input.sh",
        &format!(
            "IFS= read -r envelope\n\
             printf '%s\\n' \"$envelope\" > '{}'\n\
             printf '%s\\n' '{{\"n\":1}}' '{{\"n\":2}}'\n\
             printf '%s' '{{\"n\":3}}'\n",
            seen.display()
        ),
    );
    let output = script(dir.path(), "output.sh", &format!("cat > '{}'\n", sink.display()));

    executor()
        .execute(&providers_task(&input, &output), Command::Run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        lines(&seen),
        vec![json!({"command": "run", "config": {"interval": 5}})]
    );
    // Envelope first, then every record newline-terminated, the last one included.
    assert_eq!(
        lines(&sink),
        vec![
            json!({"command": "run", "config": {"path": "out"}}),
            json!({"n": 1}),
            json!({"n": 2}),
            json!({"n": 3}),
        ]
    );
}

#[tokio::test]
async fn test_failing_provider_fails_task() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let input = script(
        dir.path(),
        "input.sh",
        "IFS= read -r envelope\necho '{\"n\":1}'\nexit 3\n",
    );
    let output = script(dir.path(), "output.sh", "cat > /dev/null\n");

    let result = executor()
        .execute(&providers_task(&input, &output), Command::Run, CancellationToken::new())
        .await;
    match result {
        Err(Error::Provider(message)) => assert!(message.contains("input provider"), "{}", message),
        other => panic!("expected provider error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_output_that_stops_reading_is_provider_failure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let input = script(
        dir.path(),
        "input.sh",
        "IFS= read -r envelope
yes '{\"n\":1}' | head -n 200000
",
    );
    let output = script(dir.path(), "output.sh", "exit 0
");

    let result = executor()
        .execute(&providers_task(&input, &output), Command::Run, CancellationToken::new())
        .await;
    match result {
        Err(e @ Error::Provider(_)) => assert_eq!(e.exit_code(), EXIT_PROVIDER),
        other => panic!("expected provider error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_provider_binary() {
    let dir = TempDir::new().unwrap();
    let output = script(dir.path(), "output.sh", "cat > /dev/null\n");
    let result = executor()
        .execute(
            &providers_task(&dir.path().join("nope"), &output),
            Command::Run,
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cancel_stops_providers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let input = script(dir.path(), "input.sh", "exec sleep 30\n");
    let output = script(dir.path(), "output.sh", "exec cat > /dev/null\n");

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let started = std::time::Instant::now();
    let result = executor()
        .execute(&providers_task(&input, &output), Command::Run, cancel)
        .await;
    assert!(matches!(result, Err(Error::Shutdown)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_lifecycle_verb_reaches_both_providers() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("lifecycle.log");
    let body = |role: &str| {
        format!(
            "IFS= read -r envelope\nprintf '%s %s\\n' {} \"$envelope\" >> '{}'\n",
            role,
            log.display()
        )
    };
    let input = script(dir.path(), "input.sh", &body("input"));
    let output = script(dir.path(), "output.sh", &body("output"));

    executor()
        .execute(&providers_task(&input, &output), Command::Plan, CancellationToken::new())
        .await
        .unwrap();

    let entries: Vec<(String, Value)> = fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(|line| {
            let (role, envelope) = line.split_once(' ').unwrap();
            (role.to_string(), serde_json::from_str(envelope).unwrap())
        })
        .collect();
    assert_eq!(
        entries,
        vec![
            ("input".to_string(), json!({"command": "plan", "config": {"interval": 5}})),
            ("output".to_string(), json!({"command": "plan", "config": {"path": "out"}})),
        ]
    );
}

const PLUGIN: &str = r#"echo "counter plugin ready"
while IFS= read -r request; do
  id=$(printf '%s' "$request" | sed 's/.*"id":\([0-9]*\).*/\1/')
  case "$request" in
    *GetSchema*)
      printf '%s\n' "{\"id\":$id,\"result\":{\"fields\":[{\"name\":\"interval\",\"type\":\"int\",\"required\":true}]}}"
      ;;
    *Start*)
      printf '%s\n' "{\"id\":$id,\"event\":\"{\\\"n\\\":1}\"}"
      printf '%s\n' "{\"id\":$id,\"event\":\"{\\\"n\\\":2}\"}"
      printf '%s\n' "{\"id\":$id,\"result\":null}"
      ;;
  esac
done
"#;

#[tokio::test]
async fn test_plugin_task_runs_to_completion() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let plugin = script(dir.path(), "plugin.sh", PLUGIN);

    executor()
        .execute(
            &plugin_task(&plugin, json!({"interval": 5})),
            Command::Run,
            CancellationToken::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_plugin_rejects_missing_required_config() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let plugin = script(dir.path(), "plugin.sh", PLUGIN);

    let result = executor()
        .execute(&plugin_task(&plugin, json!({})), Command::Run, CancellationToken::new())
        .await;
    match result {
        Err(Error::Config(message)) => assert!(message.contains("interval"), "{}", message),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_plugin_task_only_runs() {
    let dir = TempDir::new().unwrap();
    let plugin = script(dir.path(), "plugin.sh", PLUGIN);
    let result = executor()
        .execute(
            &plugin_task(&plugin, json!({"interval": 5})),
            Command::Status,
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(Error::Config(_))));
}
