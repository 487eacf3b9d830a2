//! Cross-module scenarios: each test wires together real (not stubbed)
//! components across at least two modules, the way `main.rs`'s composition
//! root does, rather than exercising a single module in isolation.

use std::sync::Arc;
use std::time::Duration;

use lithium_core::adapters::{ControllerRequest, handle_request};
use lithium_core::bus::SubscriptionMode;
use lithium_core::dispatcher::{CommandDispatcher, CommandOptions};
use lithium_core::event_loop::{EventLoop, EventLoopConfig};
use lithium_core::registry::{ServiceRegistry, ids};
use lithium_core::script::{RetryStrategy, ScriptAnalyzer, ScriptKind, ScriptManager, ScriptManagerConfig};
use lithium_core::sequencer::{RecoveryPolicy, SchedulingPolicy, Sequencer, Target, TargetStatus, TaskSpec};
use lithium_core::{CoreError, MessageBus};

fn start_loop() -> Arc<EventLoop> {
    Arc::new(EventLoop::start(EventLoopConfig {
        workers: 2,
        timer_tick: Duration::from_millis(2),
    }))
}

fn target(name: &str, command: &str, succeed: bool, alternatives: Vec<Target>) -> Target {
    Target {
        name: name.to_string(),
        params: serde_json::Value::Null,
        tasks: vec![TaskSpec {
            uuid: uuid::Uuid::now_v7(),
            command_name: command.to_string(),
            args: serde_json::json!({ "succeed": succeed }),
        }],
        status: TargetStatus::Pending,
        retry_count: 0,
        alternatives,
        priority: 0,
        prerequisites: Vec::new(),
    }
}

async fn register_pass_fail(dispatcher: &CommandDispatcher, name: &str, succeed: bool) {
    dispatcher
        .register(
            name,
            Arc::new(move |args| {
                let ok = args.get("succeed").and_then(serde_json::Value::as_bool).unwrap_or(succeed);
                if ok {
                    Ok(serde_json::Value::Null)
                } else {
                    Err(CoreError::HandlerFailed("task failed".into()))
                }
            }),
            CommandOptions::default(),
        )
        .await
        .unwrap();
}

/// Scenario S5: a failed target recovers through its registered alternative,
/// driven end to end through a real event loop and command dispatcher.
#[tokio::test]
async fn sequencer_recovers_via_alternative_target() {
    let event_loop = start_loop();
    let dispatcher = Arc::new(CommandDispatcher::new(event_loop));

    register_pass_fail(&dispatcher, "cmd-a", true).await;
    register_pass_fail(&dispatcher, "cmd-b", false).await;
    register_pass_fail(&dispatcher, "cmd-b-alt", true).await;
    register_pass_fail(&dispatcher, "cmd-c", true).await;

    let alternative = target("B'", "cmd-b-alt", true, Vec::new());
    let a = target("A", "cmd-a", true, Vec::new());
    let b = target("B", "cmd-b", false, vec![alternative]);
    let c = target("C", "cmd-c", true, Vec::new());

    let sequencer = Sequencer::new(dispatcher, None, SchedulingPolicy::Fifo, RecoveryPolicy::Alternative, 1);
    sequencer.add_target(a).await.unwrap();
    sequencer.add_target(b).await.unwrap();
    sequencer.add_target(c).await.unwrap();

    sequencer.execute_all().await.unwrap();

    assert_eq!(sequencer.progress().await, 1.0);
    assert!(sequencer.failed_targets().await.is_empty());
}

/// Scenario S2: a command whose handler outruns its configured timeout
/// surfaces as a `Timeout` error mapped to the controller adapter's 504
/// envelope, within the dispatcher's own timeout window rather than the
/// handler's full sleep.
#[tokio::test]
async fn controller_adapter_reports_command_timeout() {
    let event_loop = start_loop();
    let dispatcher = CommandDispatcher::new(event_loop);
    dispatcher
        .register(
            "slow",
            Arc::new(|_args| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(serde_json::Value::Null)
            }),
            CommandOptions {
                timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let response = handle_request(
        &dispatcher,
        ControllerRequest {
            command: "slow".into(),
            args: serde_json::Value::Null,
        },
    )
    .await;

    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(response.status, "error");
    assert_eq!(response.code, 504);
}

/// Scenario S6: a script manager wired to a real analyzer refuses an unsafe
/// script under a safety-gated run, then runs it once the safety gate is
/// lifted, all driven through the public script-manager surface rather than
/// reaching into the analyzer directly.
#[tokio::test]
async fn script_manager_honors_analyzer_safety_gate() {
    let analyzer = Arc::new(ScriptAnalyzer::new());
    let manager = ScriptManager::new(analyzer, ScriptManagerConfig::default());
    // The analyzer matches "mkfs.ext4" as a raw substring regardless of
    // context, so this echoes the flagged text without ever invoking mkfs -
    // the ungated run below is a harmless no-op.
    manager.register("danger", "echo mkfs.ext4 simulated", ScriptKind::Shell).await.unwrap();

    let gated = manager.run("danger", Default::default(), true, None, 0, RetryStrategy::None).await;
    assert!(matches!(gated, Err(CoreError::PolicyViolation(_))));

    let ungated = manager.run("danger", Default::default(), false, None, 0, RetryStrategy::None).await;
    assert!(ungated.is_ok(), "unsafe run should still spawn once the safety gate is off");
}

/// Component H is a late-binding lookup, not an ownership root: components
/// registered by separate modules (event loop, command dispatcher, script
/// manager) are retrievable by id and typed correctly, and a registration
/// for a dropped component no longer resolves.
#[tokio::test]
async fn registry_wires_components_across_modules_and_forgets_dropped_ones() {
    let registry = ServiceRegistry::new();

    let event_loop = start_loop();
    registry.add(ids::EVENT_LOOP, &event_loop);

    let dispatcher = Arc::new(CommandDispatcher::new(event_loop.clone()));
    registry.add(ids::COMMAND_DISPATCHER, &dispatcher);

    {
        let analyzer = Arc::new(ScriptAnalyzer::new());
        let manager = Arc::new(ScriptManager::new(analyzer, ScriptManagerConfig::default()));
        registry.add(ids::SCRIPT_MANAGER, &manager);
        assert!(registry.get::<ScriptManager>(ids::SCRIPT_MANAGER).is_some());
    }
    // `manager` above is now dropped; the registry held only a weak ref.
    assert!(registry.get::<ScriptManager>(ids::SCRIPT_MANAGER).is_none());

    let resolved_dispatcher = registry.get::<CommandDispatcher>(ids::COMMAND_DISPATCHER);
    assert!(resolved_dispatcher.is_some());
    assert!(registry.get::<EventLoop>(ids::EVENT_LOOP).is_some());
}

/// Cross-module sanity check for the message bus used alongside the
/// dispatcher: a synchronous subscriber observes a publish made from a
/// command handler running on the event loop.
#[tokio::test]
async fn bus_subscriber_observes_publish_from_dispatched_command() {
    let event_loop = start_loop();
    let dispatcher = CommandDispatcher::new(event_loop);
    let bus = MessageBus::new();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    let _handle = bus
        .subscribe("target.*", SubscriptionMode::Synchronous, Arc::new(move |topic, _value| {
            seen_cb.lock().unwrap().push(topic.to_string());
        }))
        .await;

    let bus_for_handler = bus.clone();
    dispatcher
        .register(
            "announce",
            Arc::new(move |_args| {
                let bus = bus_for_handler.clone();
                tokio::spawn(async move {
                    bus.publish("target.started", serde_json::json!({"name": "A"})).await;
                });
                Ok(serde_json::Value::Null)
            }),
            CommandOptions::default(),
        )
        .await
        .unwrap();

    dispatcher.dispatch("announce", serde_json::Value::Null).await.unwrap();
    // Give the spawned publish a chance to run; synchronous delivery itself
    // is immediate once `publish` is invoked.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(seen.lock().unwrap().as_slice(), ["target.started"]);
}
