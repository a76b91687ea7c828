//! Sandboxed execution engine.
//!
//! Every invocation walks `Validating → Compiling → Invoking` and ends in
//! exactly one of `Completed`, `TimedOut` or `Faulted`. Compilation and
//! invocation run on a dedicated worker thread; the caller's task is the
//! watchdog. Both sides race to leave `Invoking` through a compare-and-swap
//! on a shared [`ExecutionState`], so exactly one of them produces the
//! [`ExecutionResult`]:
//!
//! - the worker, when the entry point returns or faults,
//! - the watchdog, when the deadline passes, the memory meter overflows,
//!   or an external cancellation runs out of grace.
//!
//! A forcibly terminated worker gets its cancellation token cancelled and
//! its runtime interrupt raised; whatever it eventually returns is discarded.
//! Its admission slot is released as soon as the watchdog wins, and the
//! thread is counted as abandoned until it actually exits. Once
//! [`SandboxConfig::max_abandoned_workers`] threads are abandoned, new
//! in-process invocations are refused instead of spawning more.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::audit::{ExecutionRecordBuilder, SandboxEvent, TerminationReason};
use crate::capability::CapabilityMap;
use crate::context::{CancellationToken, ScriptContext, WatchdogHandles};
use crate::error::SandboxError;
use crate::permissions::PermissionSet;
use crate::result::{ErrorInfo, ErrorKind, ExecutionResult};
use crate::script::{panic_message, Diagnostic, ScriptCompiler, ScriptFault};
use crate::session::SandboxContext;
use crate::validator::{validate_source, ValidatorLimits};

/// Where compiled scripts run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// A dedicated worker thread in this process (default).
    #[default]
    InProcess,
    /// One child process per invocation, killed outright when it overruns.
    ChildProcess {
        /// The worker executable.
        program: PathBuf,
    },
}

impl ExecutionMode {
    /// `in_process` or `child_process`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::ChildProcess { .. } => "child_process",
        }
    }

    /// The kind of unit a forced termination stops.
    pub(crate) fn unit(&self) -> &'static str {
        match self {
            Self::InProcess => "thread",
            Self::ChildProcess { .. } => "process",
        }
    }
}

/// Runtime settings for the engine and coordinator.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// In-process thread or child process.
    pub execution_mode: ExecutionMode,
    /// Admission limit on outstanding workers. Excess invocations queue.
    pub max_concurrent: usize,
    /// Longest an invocation waits in the admission queue.
    pub admission_timeout: Duration,
    /// In-process: forcibly terminated threads still running before new
    /// invocations are refused.
    pub max_abandoned_workers: usize,
    /// Larger sources are rejected by validation.
    pub max_source_size: usize,
    /// Bracket nesting limit for the validator pre-scan.
    pub max_nesting_depth: usize,
    /// Branch count above which the validator warns.
    pub max_branch_complexity: usize,
    /// Watchdog memory sampling period.
    pub memory_sample_interval: Duration,
    /// Child process: extra time past the deadline before the kill.
    pub kill_grace: Duration,
    /// Time a cooperatively cancelled script gets to return on its own.
    pub cancel_grace: Duration,
    /// Child process: resident memory allowed for the worker runtime itself,
    /// on top of the script's budget.
    pub rss_baseline: u64,
    /// Child process: largest IPC message accepted from a worker.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            max_concurrent: 8,
            admission_timeout: Duration::from_secs(30),
            max_abandoned_workers: 32,
            max_source_size: 256 * 1024,
            max_nesting_depth: 256,
            max_branch_complexity: 64,
            memory_sample_interval: Duration::from_millis(10),
            kill_grace: Duration::from_millis(250),
            cancel_grace: Duration::from_millis(100),
            rss_baseline: 64 * 1024 * 1024,
            max_ipc_message_size: crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

impl SandboxConfig {
    /// Limits handed to the static validator.
    pub fn validator_limits(&self) -> ValidatorLimits {
        ValidatorLimits {
            max_source_size: self.max_source_size,
            max_nesting_depth: self.max_nesting_depth,
            max_branch_complexity: self.max_branch_complexity,
        }
    }

    /// Settings for the in-process watchdog.
    pub fn watchdog_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            sample_interval: self.memory_sample_interval,
            cancel_grace: self.cancel_grace,
        }
    }
}

/// Watchdog tuning, shared with child workers over IPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Memory meter sampling period.
    pub sample_interval: Duration,
    /// Grace period after external cancellation.
    pub cancel_grace: Duration,
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecutionState {
    /// Static validation.
    Validating = 0,
    /// Waiting on the compiler collaborator.
    Compiling = 1,
    /// Entry point running on the worker.
    Invoking = 2,
    /// Returned normally within budget.
    Completed = 3,
    /// Stopped by the watchdog at the deadline.
    TimedOut = 4,
    /// Rejected, failed to compile, raised, ran out of memory or was cancelled.
    Faulted = 5,
}

impl ExecutionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Validating,
            1 => Self::Compiling,
            2 => Self::Invoking,
            3 => Self::Completed,
            4 => Self::TimedOut,
            _ => Self::Faulted,
        }
    }

    /// Whether the invocation is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Faulted)
    }
}

/// Shared state of one invocation. Transitions are compare-and-swap, so
/// when the worker and the watchdog race, exactly one wins.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ExecutionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ExecutionState {
        ExecutionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. Returns false if the state was not `from`.
    pub fn transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Count of worker threads the watchdog gave up on that are still running.
#[derive(Debug, Default)]
pub(crate) struct AbandonedWorkers(AtomicUsize);

impl AbandonedWorkers {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn lease(self: &Arc<Self>) -> Arc<WorkerLease> {
        Arc::new(WorkerLease {
            stage: AtomicU8::new(LEASE_RUNNING),
            pool: self.clone(),
        })
    }
}

const LEASE_RUNNING: u8 = 0;
const LEASE_ABANDONED: u8 = 1;
const LEASE_EXITED: u8 = 2;

/// Shared between the watchdog and one worker thread. Whichever of
/// "abandon" and "exit" comes second settles the count.
#[derive(Debug)]
struct WorkerLease {
    stage: AtomicU8,
    pool: Arc<AbandonedWorkers>,
}

impl WorkerLease {
    fn abandon(&self) {
        if self
            .stage
            .compare_exchange(LEASE_RUNNING, LEASE_ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.pool.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exited(&self) {
        if self.stage.swap(LEASE_EXITED, Ordering::SeqCst) == LEASE_ABANDONED {
            self.pool.0.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Marks the lease exited when the worker thread ends, unwinding included.
struct ExitGuard(Arc<WorkerLease>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited();
    }
}

/// Everything a worker needs to compile and invoke one script.
pub(crate) struct ScriptJob {
    pub source: String,
    pub entry_point: String,
    pub args: Vec<Value>,
    pub referenced_namespaces: Vec<String>,
    pub permissions: Arc<PermissionSet>,
}

/// A finished invocation, plus the forced-termination notice if the
/// watchdog produced it.
#[derive(Debug)]
pub(crate) struct Supervised {
    pub result: ExecutionResult,
    pub forced: Option<(TerminationReason, Duration)>,
}

impl Supervised {
    fn reported(result: ExecutionResult) -> Self {
        Self {
            result,
            forced: None,
        }
    }
}

enum WorkerEvent {
    Compiled(Result<(), Vec<Diagnostic>>),
    Finished(Result<Value, ScriptFault>),
}

/// Watchdog for one worker thread.
pub(crate) struct Supervisor {
    state: Arc<StateCell>,
    handles: WatchdogHandles,
    lease: Arc<WorkerLease>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    limit: Duration,
    memory_limit: u64,
    settings: WatchdogSettings,
    external: Option<CancellationToken>,
    began: Instant,
    invoke_started: Option<Instant>,
}

impl Supervisor {
    /// Start the worker thread. It compiles immediately; the compile window
    /// is as long as the execution limit. A thread the watchdog gives up on
    /// is counted in `abandoned` until it exits.
    pub fn spawn(
        compiler: Arc<dyn ScriptCompiler>,
        job: ScriptJob,
        capabilities: Arc<CapabilityMap>,
        settings: WatchdogSettings,
        external: Option<CancellationToken>,
        abandoned: &Arc<AbandonedWorkers>,
    ) -> Result<Self, SandboxError> {
        let ctx = ScriptContext::new(job.permissions.clone(), capabilities);
        let handles = ctx.handles();
        let state = Arc::new(StateCell::new(ExecutionState::Compiling));
        let (tx, events) = mpsc::unbounded_channel();
        let limit = job.permissions.max_execution_time();
        let memory_limit = job.permissions.max_memory_bytes();

        let lease = abandoned.lease();

        let worker_state = state.clone();
        let worker_lease = ExitGuard(lease.clone());
        std::thread::Builder::new()
            .name("modguard-worker".into())
            .spawn(move || {
                let _exit = worker_lease;
                run_worker(compiler.as_ref(), &job, &ctx, &worker_state, &tx);
            })
            .map_err(|e| {
                SandboxError::Execution(anyhow::anyhow!("failed to spawn worker thread: {e}"))
            })?;

        Ok(Self {
            state,
            handles,
            lease,
            events,
            limit,
            memory_limit,
            settings,
            external,
            began: Instant::now(),
            invoke_started: None,
        })
    }

    /// Drive the invocation to its end.
    pub async fn run(mut self) -> Result<Supervised, SandboxError> {
        if let Some(done) = self.await_compiled().await? {
            return Ok(done);
        }
        self.await_finished().await
    }

    /// Wait for compilation. `None` means the worker is now invoking.
    pub async fn await_compiled(&mut self) -> Result<Option<Supervised>, SandboxError> {
        let deadline = self.began + self.limit;
        tokio::select! {
            biased;
            event = self.events.recv() => self.compiled(event),
            _ = tokio::time::sleep_until(deadline) => {
                self.force_compile(ExecutionState::TimedOut, TerminationReason::Timeout)
                    .await
            }
            _ = wait_cancelled(self.external.as_ref()) => {
                self.force_compile(ExecutionState::Faulted, TerminationReason::Cancelled)
                    .await
            }
        }
    }

    /// Watch the running entry point until it reports or is forced out.
    pub async fn await_finished(mut self) -> Result<Supervised, SandboxError> {
        let started = self.invoke_started.unwrap_or_else(Instant::now);
        let timeout_at = started + self.limit;
        let mut cancel_at: Option<Instant> = None;
        let mut sampler = tokio::time::interval(self.settings.sample_interval);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            let deadline = cancel_at.map_or(timeout_at, |at| at.min(timeout_at));
            tokio::select! {
                biased;
                event = self.events.recv() => {
                    return self.finished(event, started, cancel_at.is_some());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break match cancel_at {
                        Some(at) if at < timeout_at => TerminationReason::Cancelled,
                        _ => TerminationReason::Timeout,
                    };
                }
                _ = wait_cancelled(self.external.as_ref()), if cancel_at.is_none() => {
                    tracing::debug!("external cancellation, signalling script");
                    self.handles.cancellation.cancel();
                    cancel_at = Some(Instant::now() + self.settings.cancel_grace);
                }
                _ = sampler.tick() => {
                    if self.handles.memory.exceeded() {
                        break TerminationReason::MemoryLimit;
                    }
                }
            }
        };

        let target = match reason {
            TerminationReason::Timeout => ExecutionState::TimedOut,
            TerminationReason::MemoryLimit | TerminationReason::Cancelled => {
                ExecutionState::Faulted
            }
        };
        if !self.state.transition(ExecutionState::Invoking, target) {
            // The worker got there first; its result is on the way.
            let event = self.events.recv().await;
            return self.finished(event, started, cancel_at.is_some());
        }

        self.handles.terminate();
        self.lease.abandon();
        let elapsed = started.elapsed();
        let peak = self.handles.memory.peak();
        let result = match reason {
            TerminationReason::Timeout => ExecutionResult::timed_out(self.limit, elapsed, peak),
            TerminationReason::MemoryLimit => {
                ExecutionResult::failed(ErrorInfo::memory(self.memory_limit), elapsed, peak)
            }
            TerminationReason::Cancelled => {
                ExecutionResult::failed(ErrorInfo::cancelled(), elapsed, peak)
            }
        };
        Ok(Supervised {
            result,
            forced: Some((reason, elapsed)),
        })
    }

    fn compiled(&mut self, event: Option<WorkerEvent>) -> Result<Option<Supervised>, SandboxError> {
        match event {
            Some(WorkerEvent::Compiled(Ok(()))) => {
                self.invoke_started = Some(Instant::now());
                Ok(None)
            }
            Some(WorkerEvent::Compiled(Err(diagnostics))) => Ok(Some(Supervised::reported(
                ExecutionResult::failed(
                    ErrorInfo::compilation(diagnostics),
                    self.began.elapsed(),
                    0,
                ),
            ))),
            Some(WorkerEvent::Finished(_)) => Err(SandboxError::Execution(anyhow::anyhow!(
                "worker reported a result before compiling"
            ))),
            None => Err(SandboxError::Execution(anyhow::anyhow!(
                "worker thread exited during compilation"
            ))),
        }
    }

    async fn force_compile(
        &mut self,
        target: ExecutionState,
        reason: TerminationReason,
    ) -> Result<Option<Supervised>, SandboxError> {
        if !self.state.transition(ExecutionState::Compiling, target) {
            let event = self.events.recv().await;
            return self.compiled(event);
        }
        self.handles.terminate();
        self.lease.abandon();
        let elapsed = self.began.elapsed();
        let result = match reason {
            TerminationReason::Timeout => ExecutionResult::timed_out(self.limit, elapsed, 0),
            _ => ExecutionResult::failed(ErrorInfo::cancelled(), elapsed, 0),
        };
        Ok(Some(Supervised {
            result,
            forced: Some((reason, elapsed)),
        }))
    }

    fn finished(
        &self,
        event: Option<WorkerEvent>,
        started: Instant,
        cancel_requested: bool,
    ) -> Result<Supervised, SandboxError> {
        let outcome = match event {
            Some(WorkerEvent::Finished(outcome)) => outcome,
            Some(WorkerEvent::Compiled(_)) => {
                return Err(SandboxError::Execution(anyhow::anyhow!(
                    "worker reported compilation twice"
                )))
            }
            None => {
                return Err(SandboxError::Execution(anyhow::anyhow!(
                    "worker thread exited without reporting a result"
                )))
            }
        };
        let elapsed = started.elapsed();
        let peak = self.handles.memory.peak();
        let result = if self.handles.memory.exceeded() {
            ExecutionResult::failed(ErrorInfo::memory(self.memory_limit), elapsed, peak)
        } else {
            match outcome {
                Ok(value) => ExecutionResult::completed(value, elapsed, peak),
                Err(_) if cancel_requested => {
                    ExecutionResult::failed(ErrorInfo::cancelled(), elapsed, peak)
                }
                Err(fault) => ExecutionResult::failed(ErrorInfo::fault(&fault), elapsed, peak),
            }
        };
        Ok(Supervised::reported(result))
    }
}

fn run_worker(
    compiler: &dyn ScriptCompiler,
    job: &ScriptJob,
    ctx: &ScriptContext,
    state: &StateCell,
    tx: &mpsc::UnboundedSender<WorkerEvent>,
) {
    let compiled = catch_unwind(AssertUnwindSafe(|| {
        compiler.compile(&job.source, &job.referenced_namespaces)
    }))
    .unwrap_or_else(|payload| {
        Err(vec![Diagnostic::new(format!(
            "compiler panicked: {}",
            panic_message(payload.as_ref())
        ))])
    });

    let unit = match compiled {
        Ok(unit) => unit,
        Err(diagnostics) => {
            if state.transition(ExecutionState::Compiling, ExecutionState::Faulted) {
                let _ = tx.send(WorkerEvent::Compiled(Err(diagnostics)));
            }
            return;
        }
    };
    // Publish Invoking before reporting, so the watchdog can only ever race
    // against the invocation itself.
    if !state.transition(ExecutionState::Compiling, ExecutionState::Invoking) {
        tracing::debug!(
            state = ?state.get(),
            "compilation finished after the watchdog gave up"
        );
        return;
    }
    if tx.send(WorkerEvent::Compiled(Ok(()))).is_err() {
        return;
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        unit.invoke(&job.entry_point, &job.args, ctx)
    }))
    .unwrap_or_else(|payload| Err(ScriptFault::from_panic(payload)));

    let next = if outcome.is_ok() && !ctx.memory().exceeded() {
        ExecutionState::Completed
    } else {
        ExecutionState::Faulted
    };
    if state.transition(ExecutionState::Invoking, next) {
        let _ = tx.send(WorkerEvent::Finished(outcome));
    } else {
        tracing::debug!(
            script_id = %job.permissions.script_id(),
            state = ?state.get(),
            "result discarded after forced termination"
        );
    }
}

pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Validates, compiles and runs one script invocation at a time per call,
/// with admission bounded across calls.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct ExecutionEngine {
    compiler: Arc<dyn ScriptCompiler>,
    context: Arc<SandboxContext>,
    config: SandboxConfig,
    admission: Arc<Semaphore>,
    abandoned: Arc<AbandonedWorkers>,
}

impl ExecutionEngine {
    /// Engine that compiles with `compiler` and reports through `context`.
    pub fn new(
        compiler: Arc<dyn ScriptCompiler>,
        context: Arc<SandboxContext>,
        config: SandboxConfig,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            compiler,
            context,
            config,
            admission,
            abandoned: Arc::default(),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The session context.
    pub fn context(&self) -> &Arc<SandboxContext> {
        &self.context
    }

    /// Free admission slots.
    pub fn available_workers(&self) -> usize {
        self.admission.available_permits()
    }

    /// Forcibly terminated worker threads that have not exited yet.
    pub fn abandoned_workers(&self) -> usize {
        self.abandoned.count()
    }

    /// Run `entry_point` of `source` under `permissions`.
    ///
    /// Never fails: every outcome, including sandbox infrastructure
    /// failures, is an [`ExecutionResult`].
    pub async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        args: Vec<Value>,
        permissions: Arc<PermissionSet>,
        cancellation: Option<CancellationToken>,
    ) -> ExecutionResult {
        let script_id = permissions.script_id().to_string();
        let record = ExecutionRecordBuilder::new(&script_id, source, entry_point);
        let events = self.context.events().clone();
        tracing::info!(
            script_id = %script_id,
            execution_id = %record.execution_id(),
            entry_point = %entry_point,
            source_len = source.len(),
            mode = self.config.execution_mode.as_str(),
            "execute: starting"
        );

        let report = validate_source(source, &permissions, &self.config.validator_limits());
        for warning in &report.warnings {
            events.emit(&SandboxEvent::Warning(warning.clone())).await;
        }

        let result = if report.is_rejected() {
            for violation in &report.violations {
                events.emit(&SandboxEvent::Violation(violation.clone())).await;
            }
            #[cfg(feature = "metrics")]
            if let Some(metrics) = self.context.metrics() {
                metrics.record_violations(report.violations.len());
            }
            tracing::warn!(
                script_id = %script_id,
                execution_id = %record.execution_id(),
                violations = report.violations.len(),
                "execute: rejected by validation"
            );
            ExecutionResult::failed(ErrorInfo::security(report.violations), record.elapsed(), 0)
        } else {
            let job = ScriptJob {
                source: source.to_string(),
                entry_point: entry_point.to_string(),
                args,
                referenced_namespaces: report.referenced_namespaces.into_iter().collect(),
                permissions,
            };
            match self.run(job, cancellation).await {
                Ok(Supervised { result, forced }) => {
                    if let Some((reason, elapsed)) = forced {
                        let notice = record.forced(reason, self.config.execution_mode.unit(), elapsed);
                        events.emit(&SandboxEvent::ForcedTermination(notice)).await;
                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = self.context.metrics() {
                            metrics.record_forced_termination(reason);
                        }
                    }
                    result
                }
                Err(e) => {
                    tracing::error!(
                        script_id = %script_id,
                        execution_id = %record.execution_id(),
                        error = %e,
                        "execute: sandbox failure"
                    );
                    ExecutionResult::failed(
                        ErrorInfo::new(ErrorKind::Internal, e.to_string()),
                        record.elapsed(),
                        0,
                    )
                }
            }
        };

        if result.success {
            tracing::info!(
                script_id = %script_id,
                execution_id = %record.execution_id(),
                elapsed_ms = result.execution_time.as_millis() as u64,
                "execute: complete"
            );
        } else {
            tracing::warn!(
                script_id = %script_id,
                execution_id = %record.execution_id(),
                outcome = result.outcome(),
                timed_out = result.timed_out,
                elapsed_ms = result.execution_time.as_millis() as u64,
                "execute: failed"
            );
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.context.metrics() {
            metrics.record_execution(result.outcome(), record.elapsed().as_secs_f64());
        }
        events
            .emit(&SandboxEvent::Execution(record.finish(&result)))
            .await;
        result
    }

    async fn run(
        &self,
        job: ScriptJob,
        cancellation: Option<CancellationToken>,
    ) -> Result<Supervised, SandboxError> {
        let in_process = self.config.execution_mode == ExecutionMode::InProcess;
        let abandoned = self.abandoned.count();
        if in_process && abandoned >= self.config.max_abandoned_workers {
            return Err(SandboxError::TooManyAbandoned {
                abandoned,
                limit: self.config.max_abandoned_workers,
            });
        }
        let permit = tokio::time::timeout(
            self.config.admission_timeout,
            self.admission.clone().acquire_owned(),
        )
        .await
        .map_err(|_| SandboxError::AdmissionTimeout {
            waited: self.config.admission_timeout,
        })?
        .map_err(|e| SandboxError::Execution(e.into()))?;
        #[cfg(feature = "metrics")]
        let _in_flight = self.context.metrics().map(|m| m.worker_started());

        match &self.config.execution_mode {
            ExecutionMode::InProcess => {
                let _permit = permit;
                Supervisor::spawn(
                    self.compiler.clone(),
                    job,
                    self.context.capabilities(),
                    self.config.watchdog_settings(),
                    cancellation,
                    &self.abandoned,
                )?
                .run()
                .await
            }
            ExecutionMode::ChildProcess { program } => {
                crate::host::execute_in_child(program, job, &self.config, cancellation, permit)
                    .await
            }
        }
    }
}
