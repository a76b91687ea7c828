//! Integration tests for `ExecutionMode::ChildProcess`, using this crate's
//! worker binary.
//!
//! These tests verify that child-process execution:
//! - Runs the invocation in a separate worker and returns its result
//! - Enforces the deadline through the worker's own watchdog
//! - Forwards external cancellation over IPC
//! - Kills the worker when its resident memory passes the allowance
//! - Reports a worker that dies early as a fault
//!
//! All tests are serialized to keep worker processes from competing on CI
//! runners.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use modguard_sandbox::testing::FixtureCompiler;
use modguard_sandbox::{
    CancellationToken, Coordinator, ErrorKind, ExecutionMode, ExecutionRequest, PermissionSet,
    Preset, SandboxConfig, SandboxContext,
};
use serde_json::json;
use serial_test::serial;

const SOURCE: &str = "class Mod { }";

fn child_process_config() -> SandboxConfig {
    SandboxConfig {
        execution_mode: ExecutionMode::ChildProcess {
            program: PathBuf::from(env!("CARGO_BIN_EXE_modguard-fixture-worker")),
        },
        ..SandboxConfig::default()
    }
}

fn coordinator(config: SandboxConfig) -> Coordinator {
    // The host never compiles in child-process mode; the worker does.
    Coordinator::new(
        Arc::new(FixtureCompiler::empty()),
        Arc::new(SandboxContext::new()),
        config,
    )
}

fn permissions(timeout_ms: u64) -> Arc<PermissionSet> {
    Arc::new(
        Preset::Standard
            .builder("child")
            .with_timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap(),
    )
}

#[tokio::test]
#[serial]
async fn child_process_simple_execution() {
    let result = coordinator(child_process_config())
        .execute(
            ExecutionRequest::new(SOURCE, "echo", permissions(5000))
                .with_args(vec![json!({"answer": 42})]),
        )
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.return_value, Some(json!([{"answer": 42}])));
}

#[tokio::test]
#[serial]
async fn child_process_rejects_before_spawning() {
    let result = coordinator(child_process_config())
        .execute(ExecutionRequest::new(
            "using System.Net.Sockets;",
            "answer",
            permissions(5000),
        ))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::SecurityViolation));
}

#[tokio::test]
#[serial]
async fn child_process_compile_error() {
    let result = coordinator(child_process_config())
        .execute(ExecutionRequest::new("#error broken", "answer", permissions(5000)))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Compilation));
}

#[tokio::test]
#[serial]
async fn child_process_timeout() {
    let started = Instant::now();
    let result = coordinator(child_process_config())
        .execute(ExecutionRequest::new(SOURCE, "spin", permissions(500)))
        .await;
    assert!(result.timed_out, "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
}

#[tokio::test]
#[serial]
async fn child_process_wedged_script_dies_with_worker() {
    let config = SandboxConfig {
        max_concurrent: 1,
        ..child_process_config()
    };
    let coord = coordinator(config);
    let result = coord
        .execute(
            ExecutionRequest::new(SOURCE, "wedge", permissions(200)).with_args(vec![json!(10_000)]),
        )
        .await;
    assert!(result.timed_out);
    // The slot comes back once the worker process is gone, not after the wedge.
    assert_eq!(coord.engine().available_workers(), 1);
}

#[tokio::test]
#[serial]
async fn child_process_cancellation() {
    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        })
    };
    let result = coordinator(child_process_config())
        .execute(
            ExecutionRequest::new(SOURCE, "spin_cooperative", permissions(10_000))
                .with_cancellation(token),
        )
        .await;
    canceller.await.unwrap();
    assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    assert!(!result.timed_out);
}

#[tokio::test]
#[serial]
async fn child_process_script_fault() {
    let result = coordinator(child_process_config())
        .execute(
            ExecutionRequest::new(SOURCE, "fail", permissions(5000))
                .with_args(vec![json!("bad save")]),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ScriptFault));
    assert_eq!(result.exception.unwrap().message, "bad save");
}

#[tokio::test]
#[serial]
async fn child_process_early_exit_is_a_fault() {
    let result = coordinator(child_process_config())
        .execute(ExecutionRequest::new(SOURCE, "exit", permissions(5000)).with_args(vec![json!(3)]))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ScriptFault));
    let message = result.exception.unwrap().message;
    assert!(message.contains("before reporting"), "{message}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
#[serial]
async fn child_process_rss_overrun_is_killed() {
    let config = SandboxConfig {
        rss_baseline: 16 * 1024 * 1024,
        ..child_process_config()
    };
    let permissions = Arc::new(
        Preset::Standard
            .builder("balloon")
            .with_max_memory(16 * 1024 * 1024)
            .with_timeout(Duration::from_secs(10))
            .build()
            .unwrap(),
    );
    let started = Instant::now();
    let result = coordinator(config)
        .execute(ExecutionRequest::new(SOURCE, "balloon", permissions))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::MemoryLimitExceeded), "{result:?}");
    assert!(!result.timed_out);
    assert!(result.peak_memory_bytes > 32 * 1024 * 1024);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
#[serial]
async fn child_processes_run_concurrently() {
    let coord = coordinator(child_process_config());
    let results = coord
        .execute_many(vec![
            ExecutionRequest::new(SOURCE, "spin", permissions(400)),
            ExecutionRequest::new(SOURCE, "answer", permissions(400)),
        ])
        .await;
    assert!(results[0].timed_out);
    assert_eq!(results[1].return_value, Some(json!(42)));
}
