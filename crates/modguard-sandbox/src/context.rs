//! Per-invocation script context: cancellation, memory accounting and
//! capability lookup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::capability::CapabilityMap;
use crate::error::{CapabilityError, MemoryLimitExceeded};
use crate::permissions::PermissionSet;
use crate::script::ScriptFault;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal.
///
/// Cloning yields a handle to the same signal. Cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_waiters();
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Byte accounting for one invocation against its memory budget.
///
/// Host APIs charge the meter for what they allocate on a script's behalf.
/// A refused charge marks the meter as exceeded; the watchdog terminates the
/// invocation even if the script swallows the error.
#[derive(Debug)]
pub struct MemoryMeter {
    limit: u64,
    current: AtomicU64,
    peak: AtomicU64,
    exceeded: AtomicBool,
}

impl MemoryMeter {
    /// Meter with a budget of `limit` bytes.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            exceeded: AtomicBool::new(false),
        }
    }

    /// Charge `bytes`. Refused if the budget would be exceeded.
    pub fn charge(&self, bytes: u64) -> Result<(), MemoryLimitExceeded> {
        let mut in_use = self.current.load(Ordering::Acquire);
        loop {
            let next = match in_use.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => {
                    self.exceeded.store(true, Ordering::SeqCst);
                    return Err(MemoryLimitExceeded {
                        requested: bytes,
                        in_use,
                        limit: self.limit,
                    });
                }
            };
            match self.current.compare_exchange_weak(
                in_use,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => in_use = actual,
            }
        }
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: u64) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Bytes currently charged.
    pub fn in_use(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Highest charge level seen.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// The budget.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Whether a charge has ever been refused.
    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }
}

/// Everything a compiled unit may touch during one invocation.
pub struct ScriptContext {
    permissions: Arc<PermissionSet>,
    capabilities: Arc<CapabilityMap>,
    cancellation: CancellationToken,
    interrupt: Arc<AtomicBool>,
    memory: Arc<MemoryMeter>,
}

impl ScriptContext {
    /// Context with a fresh token and a meter sized to the permission set's budget.
    pub fn new(permissions: Arc<PermissionSet>, capabilities: Arc<CapabilityMap>) -> Self {
        let memory = Arc::new(MemoryMeter::new(permissions.max_memory_bytes()));
        Self {
            permissions,
            capabilities,
            cancellation: CancellationToken::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            memory,
        }
    }

    /// The script's permission set.
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Cooperative cancellation token exposed to script code.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Shorthand for scripts that check cancellation at safe points.
    pub fn check_cancelled(&self) -> Result<(), ScriptFault> {
        if self.cancellation.is_cancelled() {
            Err(ScriptFault::cancelled())
        } else {
            Ok(())
        }
    }

    /// Set by the watchdog when it forcibly terminates the invocation.
    ///
    /// Meant for the script runtime's dispatch loop, not for script code:
    /// a runtime that sees this must unwind without running more script.
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// The invocation's memory meter.
    pub fn memory(&self) -> &MemoryMeter {
        &self.memory
    }

    /// Typed capability lookup, gated on the script's API categories.
    pub fn capability<T>(&self) -> Result<Arc<T>, CapabilityError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.capabilities.get::<T>(&self.permissions)
    }

    pub(crate) fn handles(&self) -> WatchdogHandles {
        WatchdogHandles {
            cancellation: self.cancellation.clone(),
            interrupt: self.interrupt.clone(),
            memory: self.memory.clone(),
        }
    }
}

/// The parts of a [`ScriptContext`] the watchdog keeps after the context
/// moves to the worker thread.
#[derive(Clone)]
pub(crate) struct WatchdogHandles {
    pub cancellation: CancellationToken,
    pub interrupt: Arc<AtomicBool>,
    pub memory: Arc<MemoryMeter>,
}

impl WatchdogHandles {
    /// Cancel cooperatively and raise the runtime interrupt.
    pub fn terminate(&self) {
        self.cancellation.cancel();
        self.interrupt.store(true, Ordering::SeqCst);
    }
}
