//! Worker side of child-process execution.
//!
//! A worker executable reads one [`HostMessage::Execute`] from stdin, runs
//! it under the same thread watchdog the in-process engine uses, reports
//! over stdout and returns. The executable should exit right after
//! [`serve`] returns, so that a worker thread that never unwound dies with
//! the process.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use modguard_sandbox::{CapabilityMap, ScriptCompiler};
//! # async fn run(compiler: Arc<dyn ScriptCompiler>) {
//! modguard_sandbox::worker::serve(compiler, Arc::new(CapabilityMap::new()))
//!     .await
//!     .ok();
//! std::process::exit(0);
//! # }
//! ```

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::capability::CapabilityMap;
use crate::context::CancellationToken;
use crate::error::SandboxError;
use crate::executor::{ScriptJob, Supervisor};
use crate::ipc::{read_message, read_message_with_limit, write_message, HostMessage, WorkerMessage};
use crate::script::ScriptCompiler;

/// Serve one invocation over the process's stdin and stdout.
pub async fn serve(
    compiler: Arc<dyn ScriptCompiler>,
    capabilities: Arc<CapabilityMap>,
) -> Result<(), SandboxError> {
    serve_io(compiler, capabilities, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one invocation over arbitrary streams.
///
/// Returns `Ok` without doing anything if the host closes the stream before
/// sending a request.
pub async fn serve_io<R, W>(
    compiler: Arc<dyn ScriptCompiler>,
    capabilities: Arc<CapabilityMap>,
    reader: R,
    mut writer: W,
) -> Result<(), SandboxError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let request = match read_message::<HostMessage, _>(&mut reader).await? {
        Some(HostMessage::Execute(request)) => request,
        Some(HostMessage::Cancel) => {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "expected Execute message, got Cancel"
            )))
        }
        None => return Ok(()),
    };

    let cancellation = CancellationToken::new();
    let max_message = request.max_ipc_message_size;
    let listener = {
        let token = cancellation.clone();
        tokio::spawn(async move {
            loop {
                match read_message_with_limit::<HostMessage, _>(&mut reader, max_message).await {
                    Ok(Some(HostMessage::Cancel)) => token.cancel(),
                    Ok(Some(HostMessage::Execute(_))) => {
                        tracing::warn!("ignoring second Execute message");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read from host");
                        break;
                    }
                }
            }
        })
    };

    let job = ScriptJob {
        source: request.source,
        entry_point: request.entry_point,
        args: request.args,
        referenced_namespaces: request.referenced_namespaces,
        permissions: Arc::new(request.permissions),
    };
    let mut supervisor = Supervisor::spawn(
        compiler,
        job,
        capabilities,
        request.settings,
        Some(cancellation),
        // The process exits after one invocation; abandoned threads go with it.
        &Arc::default(),
    )?;
    let supervised = match supervisor.await_compiled().await? {
        Some(done) => done,
        None => {
            write_message(&mut writer, &WorkerMessage::Invoking).await?;
            supervisor.await_finished().await?
        }
    };
    listener.abort();

    write_message(
        &mut writer,
        &WorkerMessage::Finished {
            result: supervised.result,
            forced: supervised.forced.map(|(reason, _)| reason),
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    use crate::audit::TerminationReason;
    use crate::ipc::WorkerRequest;
    use crate::permissions::PermissionSet;
    use crate::result::ErrorKind;
    use crate::testing::FixtureCompiler;
    use crate::SandboxConfig;

    fn request(entry: &str, timeout_ms: u64) -> HostMessage {
        HostMessage::Execute(WorkerRequest {
            source: "class A {}".into(),
            entry_point: entry.into(),
            args: Vec::new(),
            referenced_namespaces: Vec::new(),
            permissions: PermissionSet::standard("worker-test")
                .unwrap()
                .to_builder()
                .with_timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap(),
            settings: SandboxConfig::default().watchdog_settings(),
            max_ipc_message_size: 1024 * 1024,
        })
    }

    /// Start a worker on in-memory pipes; returns the host's ends.
    fn start() -> (DuplexStream, DuplexStream, tokio::task::JoinHandle<Result<(), SandboxError>>) {
        let (host_out, worker_in) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        let handle = tokio::spawn(serve_io(
            Arc::new(FixtureCompiler::new()),
            Arc::new(CapabilityMap::new()),
            worker_in,
            worker_out,
        ));
        (host_out, host_in, handle)
    }

    async fn next(stream: &mut DuplexStream) -> WorkerMessage {
        read_message(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn reports_invoking_then_result() {
        let (mut to_worker, mut from_worker, handle) = start();
        write_message(&mut to_worker, &request("answer", 1000)).await.unwrap();

        assert!(matches!(next(&mut from_worker).await, WorkerMessage::Invoking));
        match next(&mut from_worker).await {
            WorkerMessage::Finished { result, forced } => {
                assert_eq!(result.return_value, Some(json!(42)));
                assert!(forced.is_none());
            }
            other => panic!("expected Finished, got: {other:?}"),
        }
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn own_watchdog_stops_spinning_script() {
        let (mut to_worker, mut from_worker, handle) = start();
        write_message(&mut to_worker, &request("spin", 100)).await.unwrap();

        assert!(matches!(next(&mut from_worker).await, WorkerMessage::Invoking));
        match next(&mut from_worker).await {
            WorkerMessage::Finished { result, forced } => {
                assert!(result.timed_out);
                assert_eq!(forced, Some(TerminationReason::Timeout));
            }
            other => panic!("expected Finished, got: {other:?}"),
        }
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_message_reaches_the_script() {
        let (mut to_worker, mut from_worker, handle) = start();
        write_message(&mut to_worker, &request("spin_cooperative", 5000))
            .await
            .unwrap();
        assert!(matches!(next(&mut from_worker).await, WorkerMessage::Invoking));
        write_message(&mut to_worker, &HostMessage::Cancel).await.unwrap();

        match next(&mut from_worker).await {
            WorkerMessage::Finished { result, forced } => {
                assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
                assert!(forced.is_none());
            }
            other => panic!("expected Finished, got: {other:?}"),
        }
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn compile_failure_skips_invoking() {
        let (mut to_worker, mut from_worker, handle) = start();
        let HostMessage::Execute(mut req) = request("answer", 1000) else {
            unreachable!()
        };
        req.source = "#error nope".into();
        write_message(&mut to_worker, &HostMessage::Execute(req)).await.unwrap();

        match next(&mut from_worker).await {
            WorkerMessage::Finished { result, .. } => {
                assert_eq!(result.error_kind(), Some(ErrorKind::Compilation));
            }
            other => panic!("expected Finished, got: {other:?}"),
        }
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_stream_is_a_clean_exit() {
        let (to_worker, _from_worker, handle) = start();
        drop(to_worker);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_before_execute_is_rejected() {
        let (mut to_worker, _from_worker, handle) = start();
        write_message(&mut to_worker, &HostMessage::Cancel).await.unwrap();
        assert!(handle.await.unwrap().is_err());
    }
}
