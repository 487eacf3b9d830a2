//! The Command Dispatcher: a named command registry built atop the Event
//! Loop (component A).
//!
//! Modeled on `taskdaemon`'s `state::manager::StateManager` actor shape
//! (a registry of named operations, each going through a uniform
//! request/response path) crossed with its `r#loop::manager` priority
//! dispatch onto worker tasks. Registration is a `HashMap<String, Command>`
//! behind a `tokio::sync::RwLock`, matching the teacher's general idiom for
//! shared lookup tables (see `events::bus`'s subscriber list).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::event_loop::EventLoop;

pub type Handler = Arc<dyn Fn(Value) -> CoreResult<Value> + Send + Sync + 'static>;

/// The result of running one middleware over `(name, args)`.
pub enum MiddlewareOutcome {
    /// Proceed to the next middleware (or the handler) with these args.
    Continue(Value),
    /// Stop the chain here; this result is returned to the caller without
    /// the handler ever running.
    ShortCircuit(CoreResult<Value>),
}

pub type Middleware = Arc<dyn Fn(&str, Value) -> MiddlewareOutcome + Send + Sync + 'static>;

/// Registration options for a command.
#[derive(Clone)]
pub struct CommandOptions {
    pub undo: Option<Handler>,
    pub timeout: Duration,
    pub priority: i32,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            undo: None,
            timeout: Duration::from_secs(30),
            priority: 0,
        }
    }
}

struct Command {
    handler: Handler,
    undo: Option<Handler>,
    timeout: Duration,
    priority: i32,
}

/// One entry in the undo stack: the command that ran, the args it ran
/// with, and the args to feed its registered undo handler.
struct UndoRecord {
    name: String,
    inverse_args: Value,
}

const DEFAULT_UNDO_STACK_CAPACITY: usize = 128;

struct Inner {
    commands: HashMap<String, Command>,
    middlewares: Vec<Middleware>,
    undo_stack: VecDeque<UndoRecord>,
    undo_capacity: usize,
}

/// Dispatches named commands onto an `EventLoop`, applying a registration-
/// ordered middleware chain and enforcing per-command timeouts.
pub struct CommandDispatcher {
    event_loop: Arc<EventLoop>,
    inner: RwLock<Inner>,
}

impl CommandDispatcher {
    pub fn new(event_loop: Arc<EventLoop>) -> Self {
        debug!("CommandDispatcher::new: called");
        Self {
            event_loop,
            inner: RwLock::new(Inner {
                commands: HashMap::new(),
                middlewares: Vec::new(),
                undo_stack: VecDeque::new(),
                undo_capacity: DEFAULT_UNDO_STACK_CAPACITY,
            }),
        }
    }

    /// Register a command. Re-registering an existing name is an error.
    pub async fn register(
        &self,
        name: impl Into<String>,
        handler: Handler,
        opts: CommandOptions,
    ) -> CoreResult<()> {
        let name = name.into();
        debug!(%name, "CommandDispatcher::register: called");
        let mut guard = self.inner.write().await;
        if guard.commands.contains_key(&name) {
            return Err(CoreError::InvalidArgument(format!(
                "command '{name}' already registered"
            )));
        }
        guard.commands.insert(
            name,
            Command {
                handler,
                undo: opts.undo,
                timeout: opts.timeout,
                priority: opts.priority,
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> CoreResult<()> {
        debug!(%name, "CommandDispatcher::unregister: called");
        let mut guard = self.inner.write().await;
        guard
            .commands
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("command '{name}'")))
    }

    /// Append a middleware to the end of the chain (evaluated in
    /// registration order, before any command's handler runs).
    pub async fn use_middleware(&self, middleware: Middleware) {
        debug!("CommandDispatcher::use_middleware: called");
        self.inner.write().await.middlewares.push(middleware);
    }

    /// Run the middleware chain, then the named command's handler on the
    /// event loop, bounded by the command's configured timeout.
    pub async fn dispatch(&self, name: &str, args: Value) -> CoreResult<Value> {
        debug!(%name, "CommandDispatcher::dispatch: called");
        let (handler, undo, timeout, priority) = {
            let guard = self.inner.read().await;
            let command = guard
                .commands
                .get(name)
                .ok_or_else(|| CoreError::NotFound(format!("command '{name}'")))?;
            (
                command.handler.clone(),
                command.undo.clone(),
                command.timeout,
                command.priority,
            )
        };

        let mut current_args = args.clone();
        {
            let guard = self.inner.read().await;
            for middleware in &guard.middlewares {
                match middleware(name, current_args) {
                    MiddlewareOutcome::Continue(next_args) => current_args = next_args,
                    MiddlewareOutcome::ShortCircuit(result) => return result,
                }
            }
        }

        let handle = self
            .event_loop
            .post(move || handler(current_args.clone()), priority);

        let outcome = match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%name, "CommandDispatcher::dispatch: timed out");
                return Err(CoreError::Timeout(format!("command '{name}' timed out")));
            }
        };

        if outcome.is_ok() && undo.is_some() {
            let mut guard = self.inner.write().await;
            if guard.undo_stack.len() == guard.undo_capacity {
                guard.undo_stack.pop_front();
            }
            guard.undo_stack.push_back(UndoRecord {
                name: name.to_string(),
                inverse_args: args,
            });
        }

        outcome
    }

    /// Pop the top undo record and dispatch its command's registered undo
    /// handler with the recorded inverse args.
    pub async fn undo_last(&self) -> CoreResult<Value> {
        debug!("CommandDispatcher::undo_last: called");
        let record = {
            let mut guard = self.inner.write().await;
            guard
                .undo_stack
                .pop_back()
                .ok_or_else(|| CoreError::InvalidState("undo stack is empty".into()))?
        };

        let (undo_handler, priority) = {
            let guard = self.inner.read().await;
            let command = guard
                .commands
                .get(&record.name)
                .ok_or_else(|| CoreError::NotFound(format!("command '{}'", record.name)))?;
            let undo = command
                .undo
                .clone()
                .ok_or_else(|| CoreError::InvalidState(format!("command '{}' has no undo", record.name)))?;
            (undo, command.priority)
        };

        let handle = self
            .event_loop
            .post(move || undo_handler(record.inverse_args.clone()), priority);
        handle.wait().await
    }

    pub async fn undo_stack_len(&self) -> usize {
        self.inner.read().await.undo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoopConfig;
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

    fn start_loop() -> Arc<EventLoop> {
        Arc::new(EventLoop::start(EventLoopConfig {
            workers: 2,
            timer_tick: Duration::from_millis(2),
        }))
    }

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        let dispatcher = CommandDispatcher::new(start_loop());
        dispatcher
            .register(
                "echo",
                Arc::new(|args| Ok(args)),
                CommandOptions::default(),
            )
            .await
            .unwrap();

        let result = dispatcher.dispatch("echo", serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let dispatcher = CommandDispatcher::new(start_loop());
        dispatcher
            .register("noop", Arc::new(|_| Ok(Value::Null)), CommandOptions::default())
            .await
            .unwrap();
        let err = dispatcher
            .register("noop", Arc::new(|_| Ok(Value::Null)), CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[tokio::test]
    async fn dispatch_unknown_command_is_not_found() {
        let dispatcher = CommandDispatcher::new(start_loop());
        let err = dispatcher.dispatch("missing", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn scenario_s2_command_timeout() {
        // Scenario S2: handler sleeps 500ms, timeout=100ms; resolves within 150ms.
        let dispatcher = CommandDispatcher::new(start_loop());
        dispatcher
            .register(
                "slow",
                Arc::new(|_| {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(Value::Null)
                }),
                CommandOptions {
                    timeout: Duration::from_millis(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = dispatcher.dispatch("slow", Value::Null).await;
        assert!(started.elapsed() <= Duration::from_millis(150));
        assert!(matches!(result, Err(CoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let dispatcher = CommandDispatcher::new(start_loop());
        dispatcher
            .register("guarded", Arc::new(|_| Ok(serde_json::json!("ran"))), CommandOptions::default())
            .await
            .unwrap();
        dispatcher
            .use_middleware(Arc::new(|_, _| {
                MiddlewareOutcome::ShortCircuit(Err(CoreError::InvalidArgument("denied".into())))
            }))
            .await;

        let err = dispatcher.dispatch("guarded", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[tokio::test]
    async fn passthrough_middleware_yields_identical_result() {
        // Testable property 11: pure pass-through middleware changes nothing observable.
        let with_middleware = CommandDispatcher::new(start_loop());
        with_middleware
            .register("noop", Arc::new(|args| Ok(args)), CommandOptions::default())
            .await
            .unwrap();
        with_middleware
            .use_middleware(Arc::new(|_, args| MiddlewareOutcome::Continue(args)))
            .await;

        let without_middleware = CommandDispatcher::new(start_loop());
        without_middleware
            .register("noop", Arc::new(|args| Ok(args)), CommandOptions::default())
            .await
            .unwrap();

        let a = with_middleware.dispatch("noop", serde_json::json!(42)).await.unwrap();
        let b = without_middleware.dispatch("noop", serde_json::json!(42)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn undo_last_dispatches_inverse() {
        let dispatcher = CommandDispatcher::new(start_loop());
        let counter = Arc::new(AtomicI64::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();
        dispatcher
            .register(
                "increment",
                Arc::new(move |_| {
                    c1.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(Value::Null)
                }),
                CommandOptions {
                    undo: Some(Arc::new(move |_| {
                        c2.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(Value::Null)
                    })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        dispatcher.dispatch("increment", Value::Null).await.unwrap();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(dispatcher.undo_stack_len().await, 1);

        dispatcher.undo_last().await.unwrap();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undo_on_empty_stack_is_invalid_state() {
        let dispatcher = CommandDispatcher::new(start_loop());
        let err = dispatcher.undo_last().await.unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
    }
}
