//! Concurrency coordinator.
//!
//! Fans requests out over one shared [`ExecutionEngine`]. Each invocation
//! gets its own worker, context and budget; the engine's admission limit
//! bounds how many run at once, and the rest queue.

use std::sync::Arc;

use serde_json::Value;

use crate::context::CancellationToken;
use crate::executor::{ExecutionEngine, SandboxConfig};
use crate::permissions::PermissionSet;
use crate::result::{ErrorInfo, ErrorKind, ExecutionResult};
use crate::script::ScriptCompiler;
use crate::session::SandboxContext;

/// One invocation for [`Coordinator::execute_many`].
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Script source.
    pub source: String,
    /// Entry point to invoke.
    pub entry_point: String,
    /// Arguments for the entry point.
    pub args: Vec<Value>,
    /// Permissions to run under.
    pub permissions: Arc<PermissionSet>,
    /// Optional external cancellation.
    pub cancellation: Option<CancellationToken>,
}

impl ExecutionRequest {
    /// A request with no arguments and no cancellation.
    pub fn new(
        source: impl Into<String>,
        entry_point: impl Into<String>,
        permissions: Arc<PermissionSet>,
    ) -> Self {
        Self {
            source: source.into(),
            entry_point: entry_point.into(),
            args: Vec::new(),
            permissions,
            cancellation: None,
        }
    }

    /// Set the entry point's arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Attach an external cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs many isolated invocations concurrently.
///
/// Cheap to clone; clones share the engine and its admission limit.
#[derive(Clone)]
pub struct Coordinator {
    engine: Arc<ExecutionEngine>,
}

impl Coordinator {
    /// Coordinator for one host session.
    pub fn new(
        compiler: Arc<dyn ScriptCompiler>,
        context: Arc<SandboxContext>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            engine: Arc::new(ExecutionEngine::new(compiler, context, config)),
        }
    }

    /// The shared engine.
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// The session context.
    pub fn context(&self) -> &Arc<SandboxContext> {
        self.engine.context()
    }

    /// Run one request.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.engine
            .execute(
                &request.source,
                &request.entry_point,
                request.args,
                request.permissions,
                request.cancellation,
            )
            .await
    }

    /// Run all requests concurrently; results come back in input order.
    pub async fn execute_many(&self, requests: Vec<ExecutionRequest>) -> Vec<ExecutionResult> {
        tracing::debug!(count = requests.len(), "execute_many: dispatching");
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let coordinator = self.clone();
                tokio::spawn(async move { coordinator.execute(request).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "execute_many: invocation task failed");
                    ExecutionResult::failed(
                        ErrorInfo::new(ErrorKind::Internal, format!("invocation task failed: {e}")),
                        std::time::Duration::ZERO,
                        0,
                    )
                }
            };
            results.push(result);
        }
        results
    }

    /// Run under the permission set registered for `script_id`.
    pub async fn execute_registered(
        &self,
        script_id: &str,
        source: &str,
        entry_point: &str,
        args: Vec<Value>,
    ) -> ExecutionResult {
        let Some(permissions) = self.context().permissions(script_id) else {
            tracing::warn!(script_id = %script_id, "execute: no permissions registered");
            return ExecutionResult::failed(
                ErrorInfo::new(
                    ErrorKind::UnknownScript,
                    format!("no permission set registered for script '{script_id}'"),
                ),
                std::time::Duration::ZERO,
                0,
            );
        };
        self.engine
            .execute(source, entry_point, args, permissions, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::testing::FixtureCompiler;

    fn coordinator(max_concurrent: usize) -> Coordinator {
        Coordinator::new(
            Arc::new(FixtureCompiler::new()),
            Arc::new(SandboxContext::new()),
            SandboxConfig {
                max_concurrent,
                ..SandboxConfig::default()
            },
        )
    }

    fn standard(timeout_ms: u64) -> Arc<PermissionSet> {
        Arc::new(
            PermissionSet::standard("coord-test")
                .unwrap()
                .to_builder()
                .with_timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn results_keep_input_order() {
        let coord = coordinator(4);
        let requests = vec![
            ExecutionRequest::new("class A {}", "sleep", standard(2000)).with_args(vec![json!(60)]),
            ExecutionRequest::new("class A {}", "echo", standard(2000)).with_args(vec![json!("b")]),
            ExecutionRequest::new("class A {}", "fail", standard(2000)).with_args(vec![json!("c")]),
        ];
        let results = coord.execute_many(requests).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].return_value, Some(json!(60)));
        assert_eq!(results[1].return_value, Some(json!(["b"])));
        assert_eq!(results[2].error_kind(), Some(ErrorKind::ScriptFault));
    }

    #[tokio::test]
    async fn excess_requests_queue() {
        let coord = coordinator(1);
        let requests = (0..3)
            .map(|_| {
                ExecutionRequest::new("class A {}", "sleep", standard(2000)).with_args(vec![json!(50)])
            })
            .collect();
        let started = Instant::now();
        let results = coord.execute_many(requests).await;
        assert!(results.iter().all(|r| r.success));
        assert!(
            started.elapsed() >= Duration::from_millis(140),
            "ran in parallel: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn unknown_script_is_a_failed_result() {
        let coord = coordinator(2);
        let result = coord
            .execute_registered("ghost", "class A {}", "answer", Vec::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::UnknownScript));
    }

    #[tokio::test]
    async fn registered_script_runs_under_its_permissions() {
        let coord = coordinator(2);
        coord
            .context()
            .register_script(PermissionSet::restricted("weather").unwrap());

        let ok = coord
            .execute_registered("weather", "class A {}", "answer", Vec::new())
            .await;
        assert_eq!(ok.return_value, Some(json!(42)));

        let rejected = coord
            .execute_registered("weather", "using System.IO;", "answer", Vec::new())
            .await;
        assert_eq!(rejected.error_kind(), Some(ErrorKind::SecurityViolation));
    }
}
