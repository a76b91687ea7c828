//! Host side of child-process execution.
//!
//! Spawns the configured worker executable with a clean environment, sends
//! the invocation over length-delimited JSON IPC on stdin and reads the
//! worker's messages from stdout. The host keeps its own deadline, a little
//! longer than the worker's, and kills the child outright when it passes or
//! when the child's resident memory exceeds its allowance.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{Instant, MissedTickBehavior};

use crate::audit::TerminationReason;
use crate::context::CancellationToken;
use crate::error::SandboxError;
use crate::executor::{wait_cancelled, SandboxConfig, ScriptJob, Supervised};
use crate::ipc::{
    read_message_with_limit, write_message, HostMessage, WorkerMessage, WorkerRequest,
};
use crate::result::{ErrorInfo, ExecutionResult};
use crate::script::ScriptFault;

/// Worker stderr is inherited when this variable is set, discarded otherwise.
pub const DEBUG_ENV: &str = "MODGUARD_DEBUG";

enum Ending {
    Reported(ExecutionResult, Option<TerminationReason>),
    Kill(TerminationReason),
    Exited,
    Broken(std::io::Error),
}

/// Run one invocation in a fresh worker process.
///
/// `permit` is released only after the child has been reaped.
pub(crate) async fn execute_in_child(
    program: &Path,
    job: ScriptJob,
    config: &SandboxConfig,
    external: Option<CancellationToken>,
    permit: OwnedSemaphorePermit,
) -> Result<Supervised, SandboxError> {
    validate_binary(program)?;
    let limit = job.permissions.max_execution_time();
    let memory_limit = job.permissions.max_memory_bytes();
    let rss_ceiling = config.rss_baseline.saturating_add(memory_limit);

    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if std::env::var_os(DEBUG_ENV).is_some() {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "failed to spawn worker at {}: {}",
                program.display(),
                e
            ))
        })?;
    let began = Instant::now();
    let pid = child.id();
    tracing::debug!(pid = ?pid, program = %program.display(), "worker process spawned");

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdin on child")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Execution(anyhow::anyhow!("no stdout on child")))?;

    let request = HostMessage::Execute(WorkerRequest {
        source: job.source,
        entry_point: job.entry_point,
        args: job.args,
        referenced_namespaces: job.referenced_namespaces,
        permissions: job.permissions.as_ref().clone(),
        settings: config.watchdog_settings(),
        max_ipc_message_size: config.max_ipc_message_size,
    });
    write_message(&mut stdin, &request).await?;

    // Frame reads are not cancel-safe, so they get their own task.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let max_message = config.max_ipc_message_size;
    let reader = tokio::spawn(async move {
        let mut stdout = BufReader::new(stdout);
        loop {
            match read_message_with_limit::<WorkerMessage, _>(&mut stdout, max_message).await {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });

    let mut timeout_at = began + limit + config.kill_grace;
    let mut cancel_at: Option<Instant> = None;
    let mut invoke_started: Option<Instant> = None;
    let mut peak_rss = 0u64;
    let mut sampler = tokio::time::interval(config.memory_sample_interval);
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ending = loop {
        let deadline = cancel_at.map_or(timeout_at, |at| at.min(timeout_at));
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(Ok(WorkerMessage::Invoking)) => {
                    let now = Instant::now();
                    invoke_started = Some(now);
                    timeout_at = now + limit + config.kill_grace;
                }
                Some(Ok(WorkerMessage::Finished { result, forced })) => {
                    break Ending::Reported(result, forced);
                }
                Some(Ok(WorkerMessage::Log { message })) => {
                    tracing::debug!(target: "modguard::worker", "{}", message);
                }
                Some(Err(e)) => break Ending::Broken(e),
                None => break Ending::Exited,
            },
            _ = tokio::time::sleep_until(deadline) => {
                break match cancel_at {
                    Some(at) if at < timeout_at => Ending::Kill(TerminationReason::Cancelled),
                    _ => Ending::Kill(TerminationReason::Timeout),
                };
            }
            _ = wait_cancelled(external.as_ref()), if cancel_at.is_none() => {
                cancel_at = Some(Instant::now() + config.cancel_grace + config.kill_grace);
                if let Err(e) = write_message(&mut stdin, &HostMessage::Cancel).await {
                    tracing::debug!(error = %e, "failed to forward cancellation to worker");
                }
            }
            _ = sampler.tick() => {
                if let Some(rss) = sample_rss(pid).await {
                    peak_rss = peak_rss.max(rss);
                    if rss > rss_ceiling {
                        break Ending::Kill(TerminationReason::MemoryLimit);
                    }
                }
            }
        }
    };

    let started = invoke_started.unwrap_or(began);
    let outcome = match ending {
        Ending::Reported(result, forced) => {
            reap(&mut child, config.kill_grace).await;
            let forced = forced.map(|reason| (reason, result.execution_time));
            Ok(Supervised { result, forced })
        }
        Ending::Kill(reason) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill worker process");
            }
            let elapsed = started.elapsed();
            let result = match reason {
                TerminationReason::Timeout => ExecutionResult::timed_out(limit, elapsed, peak_rss),
                TerminationReason::MemoryLimit => {
                    ExecutionResult::failed(ErrorInfo::memory(memory_limit), elapsed, peak_rss)
                }
                TerminationReason::Cancelled => {
                    ExecutionResult::failed(ErrorInfo::cancelled(), elapsed, peak_rss)
                }
            };
            Ok(Supervised {
                result,
                forced: Some((reason, elapsed)),
            })
        }
        Ending::Exited => {
            let status = child.wait().await?;
            Ok(Supervised {
                result: ExecutionResult::failed(
                    ErrorInfo::fault(&early_exit(status)),
                    started.elapsed(),
                    peak_rss,
                ),
                forced: None,
            })
        }
        Ending::Broken(e) => {
            let _ = child.kill().await;
            Err(SandboxError::Ipc(e))
        }
    };

    reader.abort();
    drop(permit);
    outcome
}

fn early_exit(status: ExitStatus) -> ScriptFault {
    ScriptFault::new(format!(
        "worker process exited with {status} before reporting a result"
    ))
}

/// Give a worker that already reported `grace` to exit, then kill it.
async fn reap(child: &mut Child, grace: std::time::Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "failed to wait for worker process"),
        Err(_) => {
            tracing::debug!("worker process lingered after reporting, killing it");
            let _ = child.kill().await;
        }
    }
}

/// Check that `path` is a usable worker executable.
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn validate_binary(path: &Path) -> Result<(), SandboxError> {
    if !path.is_absolute() {
        return Err(SandboxError::WorkerBinary {
            reason: format!("worker path must be absolute, got {}", path.display()),
        });
    }
    let metadata = std::fs::metadata(path).map_err(|e| SandboxError::WorkerBinary {
        reason: format!("cannot read metadata for {}: {}", path.display(), e),
    })?;
    if !metadata.is_file() {
        return Err(SandboxError::WorkerBinary {
            reason: format!("{} is not a file", path.display()),
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::WorkerBinary {
                reason: format!(
                    "insecure permissions on {}: mode {:o} is world-writable",
                    path.display(),
                    mode
                ),
            });
        }
    }
    Ok(())
}

/// Resident set size of `pid` in bytes. Linux only; `None` elsewhere.
async fn sample_rss(pid: Option<u32>) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid?))
        .await
        .ok()?;
    parse_vm_rss(&status)
}

/// Extract `VmRSS` from `/proc/<pid>/status` content, in bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line["VmRSS:".len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    kib.checked_mul(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss_in_kib() {
        let status = "Name:\tworker\nVmPeak:\t  20000 kB\nVmRSS:\t   10240 kB\nThreads:\t2\n";
        assert_eq!(parse_vm_rss(status), Some(10 * 1024 * 1024));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
        assert_eq!(parse_vm_rss("VmRSS:\tlots kB\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn samples_own_rss() {
        let rss = sample_rss(Some(std::process::id())).await.unwrap();
        assert!(rss > 0);
        assert!(sample_rss(None).await.is_none());
    }

    #[test]
    fn rejects_relative_and_missing_binaries() {
        let err = validate_binary(Path::new("bin/worker")).unwrap_err();
        assert!(err.to_string().contains("absolute"), "error: {err}");

        let err = validate_binary(Path::new("/nonexistent/modguard-worker")).unwrap_err();
        assert!(err.to_string().contains("metadata"), "error: {err}");

        let dir = tempfile::tempdir().unwrap();
        let err = validate_binary(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not a file"), "error: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn rejects_world_writable_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("modguard-worker");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        let err = validate_binary(&bin).unwrap_err();
        assert!(err.to_string().contains("insecure"), "error: {err}");

        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(validate_binary(&bin).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_names_status() {
        use std::os::unix::process::ExitStatusExt;
        let fault = early_exit(ExitStatus::from_raw(3 << 8));
        assert!(fault.message.contains("exit status: 3"), "{}", fault.message);
    }
}
