//! modguard fixture worker: child-process sandbox worker for tests.
//!
//! Spawned by the host in `ChildProcess` mode. Reads one invocation from
//! stdin, runs it with the fixture compiler under the worker-side watchdog
//! and writes the result to stdout. Besides the fixture compiler's entry
//! points it provides two that only make sense in a separate process:
//!
//! - `exit`: exits the process with code `args[0]` without reporting
//! - `balloon`: allocates and touches real memory, `args[0]` bytes at a time,
//!   without charging the meter, so only the host's RSS sampling can stop it

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use modguard_sandbox::testing::FixtureCompiler;
use modguard_sandbox::{CapabilityMap, ScriptFault};
use serde_json::Value;

fn compiler() -> FixtureCompiler {
    FixtureCompiler::new()
        .with_entry("exit", |args, _| {
            let code = args.first().and_then(Value::as_i64).unwrap_or(3);
            std::process::exit(code as i32)
        })
        .with_entry("balloon", |args, ctx| {
            let chunk = args
                .first()
                .and_then(Value::as_u64)
                .unwrap_or(4 * 1024 * 1024) as usize;
            let mut held: Vec<Vec<u8>> = Vec::new();
            while !ctx.interrupt_requested() {
                held.push(vec![0xA5; chunk]);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(ScriptFault::new(format!(
                "execution interrupted after {} chunks",
                held.len()
            )))
        })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Host spawns with a cleared environment; drop anything that slipped through.
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    modguard_sandbox::worker::serve(Arc::new(compiler()), Arc::new(CapabilityMap::new()))
        .await
        .context("worker failed")?;

    // A worker thread that never unwound must not keep the process alive.
    std::process::exit(0)
}
