// Path: crates/minion/src/functions.rs
//! The registered function table.
//!
//! Functions are keyed `module.fun` and invoked with an explicit
//! [`ExecContext`] capability object: configuration, grains, the local
//! event bus, job metadata, and the cooperative cancellation flag. There
//! is no ambient state and nothing is loaded at runtime; embedders extend
//! the table through [`FunctionRegistry::register`].

use futures::future::BoxFuture;
use futures::FutureExt;
use herd_bus::EventBus;
use herd_types::config::MinionConfig;
use herd_types::error::DispatchError;
use herd_types::JobId;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The capability bundle handed to every function invocation.
#[derive(Clone)]
pub struct ExecContext {
    /// The minion configuration.
    pub opts: Arc<MinionConfig>,
    /// The effective grains.
    pub grains: Map<String, Value>,
    /// The job being executed.
    pub jid: JobId,
    /// The minion-local event bus.
    pub events: EventBus,
    cancel: Arc<AtomicBool>,
}

impl ExecContext {
    /// Builds a context for one job execution.
    pub fn new(
        opts: Arc<MinionConfig>,
        grains: Map<String, Value>,
        jid: JobId,
        events: EventBus,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            opts,
            grains,
            jid,
            events,
            cancel,
        }
    }

    /// The cooperative cancellation checkpoint. Long-running functions
    /// poll this and wind down when it flips.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// The signature every registered function implements.
pub type ExecFn = Arc<
    dyn Fn(ExecContext, Vec<Value>, Map<String, Value>) -> BoxFuture<'static, Result<Value, DispatchError>>
        + Send
        + Sync,
>;

/// The function table.
pub struct FunctionRegistry {
    funcs: HashMap<String, ExecFn>,
}

impl FunctionRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }

    /// The built-in table exercising the dispatch path.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register("test.echo", |_ctx, arg, _kwarg| {
            async move {
                Ok(match arg.len() {
                    0 => Value::Null,
                    1 => arg.into_iter().next().unwrap_or(Value::Null),
                    _ => Value::Array(arg),
                })
            }
            .boxed()
        });

        registry.register("test.ping", |_ctx, _arg, _kwarg| {
            async move { Ok(json!(true)) }.boxed()
        });

        registry.register("test.sleep", |ctx, arg, _kwarg| {
            async move {
                let secs = arg
                    .first()
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| DispatchError::BadArguments("test.sleep needs seconds".into()))?;
                let deadline =
                    tokio::time::Instant::now() + Duration::from_secs_f64(secs.max(0.0));
                // Poll the cancellation flag at a fixed checkpoint cadence.
                while tokio::time::Instant::now() < deadline {
                    if ctx.cancelled() {
                        return Ok(json!(false));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(json!(true))
            }
            .boxed()
        });

        registry.register("test.fail", |_ctx, _arg, _kwarg| {
            async move {
                Err(DispatchError::BadArguments(
                    "test.fail always fails".into(),
                ))
            }
            .boxed()
        });

        registry.register("grains.items", |ctx, _arg, _kwarg| {
            async move { Ok(Value::Object(ctx.grains.clone())) }.boxed()
        });

        let names: Vec<String> = {
            let mut names: Vec<String> = registry.funcs.keys().cloned().collect();
            names.push("sys.list_functions".to_string());
            names.sort();
            names
        };
        registry.register("sys.list_functions", move |_ctx, _arg, _kwarg| {
            let names = names.clone();
            async move { Ok(json!(names)) }.boxed()
        });

        registry
    }

    /// Registers a function under `module.fun`.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(ExecContext, Vec<Value>, Map<String, Value>) -> BoxFuture<'static, Result<Value, DispatchError>>
            + Send
            + Sync
            + 'static,
    {
        self.funcs.insert(name.to_string(), Arc::new(f));
    }

    /// Looks a function up.
    pub fn get(&self, name: &str) -> Option<ExecFn> {
        self.funcs.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.funcs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
