//! Fixture compiler for tests and the fixture worker binary.
//!
//! [`FixtureCompiler`] never parses the source beyond looking for `#error`
//! lines. Every compiled unit exposes the same named entry points, each a
//! Rust closure standing in for script behaviour:
//!
//! | entry | behaviour |
//! |-------|-----------|
//! | `answer` | returns `42` |
//! | `echo` | returns its arguments as an array |
//! | `fail` | raises a fault with `args[0]` as message |
//! | `panic` | panics |
//! | `spin` | busy-loops ignoring the cancellation token; only the runtime interrupt stops it |
//! | `spin_cooperative` | loops until the cancellation token fires |
//! | `sleep` | sleeps `args[0]` ms in slices, unwinding on interrupt |
//! | `wedge` | blocks for `args[0]` ms (default 3000) ignoring everything |
//! | `hog` | charges `args[0]` bytes (default 1 MiB) at a time, swallowing refusals |
//!
//! [`FixtureCompiler::with_compile_delay`] makes `compile` itself block, for
//! exercising the compile-phase watchdog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::context::ScriptContext;
use crate::script::{CompiledUnit, Diagnostic, ScriptCompiler, ScriptFault};

/// Signature of a fixture entry point.
pub type EntryFn =
    Arc<dyn Fn(&[Value], &ScriptContext) -> Result<Value, ScriptFault> + Send + Sync>;

/// Compiler collaborator whose entry points are registered closures.
#[derive(Clone)]
pub struct FixtureCompiler {
    entries: Arc<HashMap<String, EntryFn>>,
    compiles: Arc<AtomicUsize>,
    compile_delay: Duration,
}

impl Default for FixtureCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureCompiler {
    /// Compiler with the built-in entry points.
    pub fn new() -> Self {
        Self::empty()
            .with_entry("answer", |_, _| Ok(json!(42)))
            .with_entry("echo", |args, _| Ok(Value::Array(args.to_vec())))
            .with_entry("fail", |args, _| {
                let message = args
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("fixture failure");
                Err(ScriptFault::new(message))
            })
            .with_entry("panic", |_, _| panic!("fixture panic"))
            .with_entry("spin", |_, ctx| {
                while !ctx.interrupt_requested() {
                    std::hint::spin_loop();
                }
                Err(ScriptFault::new("execution interrupted"))
            })
            .with_entry("spin_cooperative", |_, ctx| loop {
                ctx.check_cancelled()?;
                std::thread::sleep(Duration::from_millis(1));
            })
            .with_entry("sleep", |args, ctx| {
                let ms = u64_arg(args, 100);
                let until = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < until {
                    if ctx.interrupt_requested() {
                        return Err(ScriptFault::new("execution interrupted"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(json!(ms))
            })
            .with_entry("wedge", |args, _| {
                std::thread::sleep(Duration::from_millis(u64_arg(args, 3000)));
                Ok(json!("woke"))
            })
            .with_entry("hog", |args, ctx| {
                let chunk = u64_arg(args, 1024 * 1024);
                loop {
                    if ctx.interrupt_requested() {
                        return Err(ScriptFault::new("execution interrupted"));
                    }
                    // Swallow refusals, like a script catching the error.
                    let _ = ctx.memory().charge(chunk);
                    std::thread::yield_now();
                }
            })
    }

    /// Compiler with no entry points.
    pub fn empty() -> Self {
        Self {
            entries: Arc::new(HashMap::new()),
            compiles: Arc::new(AtomicUsize::new(0)),
            compile_delay: Duration::ZERO,
        }
    }

    /// Register (or replace) an entry point.
    pub fn with_entry<F>(mut self, name: &str, entry: F) -> Self
    where
        F: Fn(&[Value], &ScriptContext) -> Result<Value, ScriptFault> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.entries).insert(name.to_string(), Arc::new(entry));
        self
    }

    /// Block every `compile` call for `delay` before producing a unit,
    /// ignoring cancellation and interrupts.
    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = delay;
        self
    }

    /// How many times `compile` ran, across clones.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

fn u64_arg(args: &[Value], default: u64) -> u64 {
    args.first().and_then(Value::as_u64).unwrap_or(default)
}

impl ScriptCompiler for FixtureCompiler {
    fn compile(
        &self,
        source: &str,
        _referenced_namespaces: &[String],
    ) -> Result<Box<dyn CompiledUnit>, Vec<Diagnostic>> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if !self.compile_delay.is_zero() {
            std::thread::sleep(self.compile_delay);
        }
        let diagnostics: Vec<Diagnostic> = source
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let col = line.find("#error")?;
                let message = line[col + "#error".len()..].trim();
                let message = if message.is_empty() {
                    "error directive"
                } else {
                    message
                };
                Some(
                    Diagnostic::new(message)
                        .with_code("FX0001")
                        .at(index as u32 + 1, col as u32 + 1),
                )
            })
            .collect();
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }
        Ok(Box::new(FixtureUnit {
            entries: self.entries.clone(),
        }))
    }
}

struct FixtureUnit {
    entries: Arc<HashMap<String, EntryFn>>,
}

impl CompiledUnit for FixtureUnit {
    fn invoke(
        &self,
        entry_point: &str,
        args: &[Value],
        ctx: &ScriptContext,
    ) -> Result<Value, ScriptFault> {
        match self.entries.get(entry_point) {
            Some(entry) => entry(args, ctx),
            None => Err(ScriptFault::new(format!(
                "entry point '{entry_point}' not found"
            ))),
        }
    }
}
