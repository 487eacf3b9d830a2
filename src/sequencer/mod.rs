//! The Exposure Sequencer: ordered execution of imaging targets through the
//! Command Dispatcher, with pluggable scheduling and recovery policies.
//!
//! Dependency-cycle detection is grounded on `taskdaemon`'s
//! `r#loop::manager::validate_dependency_graph`/`has_cycle_dfs` (DFS with a
//! recursion-stack set, returning the offending path), adapted from loop IDs
//! to target names. Task execution and streaming status reporting follow
//! `r#loop::validation::run_validation`'s spawn-with-timeout idiom, run here
//! through the Command Dispatcher (component C) instead of a raw shell.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::dispatcher::CommandDispatcher;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetStatus {
    Pending,
    Running,
    Skipped,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    Fifo,
    Priority,
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPolicy {
    Abort,
    Skip,
    Alternative,
    Retry(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub uuid: Uuid,
    #[serde(rename = "command")]
    pub command_name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub params: Value,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub status: TargetStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub alternatives: Vec<Target>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl Default for TargetStatus {
    fn default() -> Self {
        TargetStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequenceStats {
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub duration: Duration,
}

/// Execution policy for a sequence document, nested under `policy` on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencePolicy {
    pub scheduling: SchedulingPolicy,
    pub recovery: RecoveryPolicy,
    pub max_concurrent: usize,
    pub global_timeout_seconds: Option<u64>,
}

/// On-disk document: `{ version, targets: [...], policy: {...} }`, restored
/// verbatim on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDocument {
    pub version: u32,
    pub targets: Vec<Target>,
    pub policy: SequencePolicy,
}

struct Inner {
    targets: Vec<Target>,
    scheduling: SchedulingPolicy,
    recovery: RecoveryPolicy,
    max_concurrent: usize,
    global_timeout: Option<Duration>,
    failed: HashSet<String>,
    stats: SequenceStats,
    paused: bool,
}

/// Executes an ordered list of targets, one `TaskSpec` list at a time per
/// target, through a shared `CommandDispatcher`.
pub struct Sequencer {
    dispatcher: Arc<CommandDispatcher>,
    bus: Option<MessageBus>,
    inner: RwLock<Inner>,
    stop_flag: Arc<AtomicBool>,
}

impl Sequencer {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        bus: Option<MessageBus>,
        scheduling: SchedulingPolicy,
        recovery: RecoveryPolicy,
        max_concurrent: usize,
    ) -> Self {
        debug!(?scheduling, ?recovery, max_concurrent, "Sequencer::new: called");
        Self {
            dispatcher,
            bus,
            inner: RwLock::new(Inner {
                targets: Vec::new(),
                scheduling,
                recovery,
                max_concurrent,
                global_timeout: None,
                failed: HashSet::new(),
                stats: SequenceStats::default(),
                paused: false,
            }),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn set_global_timeout(&self, timeout: Option<Duration>) {
        self.inner.write().await.global_timeout = timeout;
    }

    pub async fn add_target(&self, target: Target) -> CoreResult<()> {
        debug!(name = %target.name, "Sequencer::add_target: called");
        let mut guard = self.inner.write().await;
        if guard.targets.iter().any(|t| t.name == target.name) {
            return Err(CoreError::InvalidArgument(format!("target '{}' already exists", target.name)));
        }
        guard.targets.push(target);
        if guard.scheduling == SchedulingPolicy::Dependency {
            validate_dependency_graph(&guard.targets).map_err(|cycle| {
                CoreError::DefinitionError(format!("dependency cycle: {}", cycle.join(" -> ")))
            })?;
        }
        Ok(())
    }

    pub async fn remove_target(&self, name: &str) -> CoreResult<()> {
        let mut guard = self.inner.write().await;
        let before = guard.targets.len();
        guard.targets.retain(|t| t.name != name);
        if guard.targets.len() == before {
            return Err(CoreError::NotFound(format!("target '{name}'")));
        }
        Ok(())
    }

    pub async fn modify_target(&self, name: &str, mutator: impl FnOnce(&mut Target)) -> CoreResult<()> {
        let mut guard = self.inner.write().await;
        let target = guard
            .targets
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| CoreError::NotFound(format!("target '{name}'")))?;
        mutator(target);
        Ok(())
    }

    pub async fn set_target_params(&self, name: &str, params: Value) -> CoreResult<()> {
        self.modify_target(name, |t| t.params = params).await
    }

    pub async fn target_params(&self, name: &str) -> CoreResult<Value> {
        let guard = self.inner.read().await;
        guard
            .targets
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.params.clone())
            .ok_or_else(|| CoreError::NotFound(format!("target '{name}'")))
    }

    pub async fn set_target_task_params(&self, name: &str, task_uuid: Uuid, params: Value) -> CoreResult<()> {
        self.modify_target(name, |t| {
            if let Some(task) = t.tasks.iter_mut().find(|task| task.uuid == task_uuid) {
                task.args = params;
            }
        })
        .await
    }

    pub async fn target_task_params(&self, name: &str, task_uuid: Uuid) -> CoreResult<Value> {
        let guard = self.inner.read().await;
        let target = guard
            .targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| CoreError::NotFound(format!("target '{name}'")))?;
        target
            .tasks
            .iter()
            .find(|task| task.uuid == task_uuid)
            .map(|task| task.args.clone())
            .ok_or_else(|| CoreError::NotFound(format!("task '{task_uuid}'")))
    }

    pub async fn progress(&self) -> f64 {
        let guard = self.inner.read().await;
        let total = guard.targets.len();
        if total == 0 {
            return 1.0;
        }
        let finished = guard
            .targets
            .iter()
            .filter(|t| matches!(t.status, TargetStatus::Succeeded | TargetStatus::Skipped | TargetStatus::Failed))
            .count();
        finished as f64 / total as f64
    }

    pub async fn failed_targets(&self) -> Vec<String> {
        self.inner.read().await.failed.iter().cloned().collect()
    }

    pub async fn retry_failed(&self) -> usize {
        let mut guard = self.inner.write().await;
        let names: Vec<String> = guard.failed.drain().collect();
        let mut n = 0;
        for target in guard.targets.iter_mut() {
            if names.contains(&target.name) {
                target.status = TargetStatus::Pending;
                target.retry_count = 0;
                n += 1;
            }
        }
        n
    }

    pub async fn stats(&self) -> SequenceStats {
        self.inner.read().await.stats.clone()
    }

    pub async fn pause(&self) {
        self.inner.write().await.paused = true;
    }

    pub async fn resume(&self) {
        self.inner.write().await.paused = false;
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    async fn publish(&self, topic: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, payload).await;
        }
    }

    /// Run the sequence to completion (or until `stop()`, a recovery policy
    /// gives up, or the global timeout elapses).
    pub async fn execute_all(&self) -> CoreResult<()> {
        debug!("Sequencer::execute_all: called");
        self.stop_flag.store(false, Ordering::Release);
        let started = Instant::now();
        self.inner.write().await.stats.started += 1;

        let (scheduling, global_timeout) = {
            let guard = self.inner.read().await;
            (guard.scheduling, guard.global_timeout)
        };

        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            if let Some(limit) = global_timeout
                && started.elapsed() >= limit
            {
                warn!("Sequencer::execute_all: global timeout exceeded");
                self.stop();
                break;
            }
            while self.inner.read().await.paused && !self.stop_flag.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let next_name = self.next_ready_target(scheduling).await;
            let Some(name) = next_name else {
                break;
            };

            self.run_target(&name).await;
        }

        self.publish("sequence.done", serde_json::json!({})).await;
        self.inner.write().await.stats.duration = started.elapsed();
        Ok(())
    }

    async fn next_ready_target(&self, scheduling: SchedulingPolicy) -> Option<String> {
        let guard = self.inner.read().await;
        let pending: Vec<&Target> = guard.targets.iter().filter(|t| t.status == TargetStatus::Pending).collect();
        if pending.is_empty() {
            return None;
        }

        match scheduling {
            SchedulingPolicy::Fifo => pending.first().map(|t| t.name.clone()),
            SchedulingPolicy::Priority => pending
                .iter()
                .fold(None::<&&Target>, |best, t| match best {
                    Some(b) if b.priority >= t.priority => Some(b),
                    _ => Some(t),
                })
                .map(|t| t.name.clone()),
            SchedulingPolicy::Dependency => pending
                .iter()
                .find(|t| {
                    t.prerequisites.iter().all(|dep| {
                        guard
                            .targets
                            .iter()
                            .find(|candidate| &candidate.name == dep)
                            .map(|candidate| candidate.status == TargetStatus::Succeeded)
                            .unwrap_or(false)
                    })
                })
                .map(|t| t.name.clone()),
        }
    }

    async fn run_target(&self, name: &str) {
        debug!(%name, "Sequencer::run_target: called");
        self.set_status(name, TargetStatus::Running).await;
        self.publish("target-started", serde_json::json!({ "name": name })).await;

        let tasks = {
            let guard = self.inner.read().await;
            guard.targets.iter().find(|t| t.name == name).map(|t| t.tasks.clone()).unwrap_or_default()
        };

        let outcome = self.run_tasks(&tasks).await;

        if outcome.is_ok() {
            self.set_status(name, TargetStatus::Succeeded).await;
            self.inner.write().await.stats.finished += 1;
            self.publish(
                "target-finished",
                serde_json::json!({ "name": name, "status": "Succeeded" }),
            )
            .await;
        } else {
            self.handle_failure(name).await;
        }

        let progress = self.progress().await;
        self.publish("sequence-progress", serde_json::json!({ "progress": progress })).await;
    }

    async fn run_tasks(&self, tasks: &[TaskSpec]) -> CoreResult<()> {
        for task in tasks {
            if self.stop_flag.load(Ordering::Acquire) {
                return Err(CoreError::Canceled("sequencer stopped".into()));
            }
            self.dispatcher.dispatch(&task.command_name, task.args.clone()).await?;
        }
        Ok(())
    }

    async fn handle_failure(&self, name: &str) {
        let recovery = self.inner.read().await.recovery;
        match recovery {
            RecoveryPolicy::Abort => {
                self.set_status(name, TargetStatus::Failed).await;
                self.mark_failed(name).await;
                self.publish(
                    "target-finished",
                    serde_json::json!({ "name": name, "status": "Failed" }),
                )
                .await;
                self.stop();
            }
            RecoveryPolicy::Skip => {
                self.set_status(name, TargetStatus::Skipped).await;
                self.mark_failed(name).await;
                self.publish(
                    "target-finished",
                    serde_json::json!({ "name": name, "status": "Skipped" }),
                )
                .await;
            }
            RecoveryPolicy::Alternative => {
                let alternatives = {
                    let guard = self.inner.read().await;
                    guard.targets.iter().find(|t| t.name == name).map(|t| t.alternatives.clone()).unwrap_or_default()
                };
                for alt in alternatives {
                    if self.run_tasks(&alt.tasks).await.is_ok() {
                        self.set_status(name, TargetStatus::Succeeded).await;
                        self.publish(
                            "target-finished",
                            serde_json::json!({ "name": name, "status": "Succeeded", "via": "alternative" }),
                        )
                        .await;
                        return;
                    }
                }
                self.set_status(name, TargetStatus::Failed).await;
                self.mark_failed(name).await;
                self.publish(
                    "target-finished",
                    serde_json::json!({ "name": name, "status": "Failed" }),
                )
                .await;
            }
            RecoveryPolicy::Retry(n) => {
                let retry_count = {
                    let mut guard = self.inner.write().await;
                    let target = guard.targets.iter_mut().find(|t| t.name == name).expect("target exists");
                    target.retry_count += 1;
                    target.retry_count
                };
                if retry_count <= n {
                    self.set_status(name, TargetStatus::Pending).await;
                } else {
                    self.set_status(name, TargetStatus::Skipped).await;
                    self.mark_failed(name).await;
                    self.publish(
                        "target-finished",
                        serde_json::json!({ "name": name, "status": "Skipped" }),
                    )
                    .await;
                }
            }
        }
    }

    async fn mark_failed(&self, name: &str) {
        let mut guard = self.inner.write().await;
        guard.failed.insert(name.to_string());
        guard.stats.failed += 1;
    }

    async fn set_status(&self, name: &str, status: TargetStatus) {
        let mut guard = self.inner.write().await;
        if let Some(target) = guard.targets.iter_mut().find(|t| t.name == name) {
            target.status = status;
        }
    }

    /// Serialize the full sequence definition to a JSON document.
    pub async fn save(&self, path: &Path) -> CoreResult<()> {
        debug!(?path, "Sequencer::save: called");
        let guard = self.inner.read().await;
        let doc = SequenceDocument {
            version: 1,
            targets: guard.targets.clone(),
            policy: SequencePolicy {
                scheduling: guard.scheduling,
                recovery: guard.recovery,
                max_concurrent: guard.max_concurrent,
                global_timeout_seconds: guard.global_timeout.map(|d| d.as_secs()),
            },
        };
        let text = serde_json::to_string_pretty(&doc).map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| CoreError::InvalidArgument(format!("writing sequence document: {e}")))
    }

    /// Load a sequence definition, replacing the current one. Validation-
    /// strict: a dependency cycle under `Dependency` scheduling is rejected.
    pub async fn load(&self, path: &Path) -> CoreResult<()> {
        debug!(?path, "Sequencer::load: called");
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidArgument(format!("reading sequence document: {e}")))?;
        let doc: SequenceDocument =
            serde_json::from_str(&text).map_err(|e| CoreError::InvalidArgument(format!("parsing sequence document: {e}")))?;

        if doc.policy.scheduling == SchedulingPolicy::Dependency {
            validate_dependency_graph(&doc.targets)
                .map_err(|cycle| CoreError::DefinitionError(format!("dependency cycle: {}", cycle.join(" -> "))))?;
        }

        let mut guard = self.inner.write().await;
        guard.targets = doc.targets;
        guard.scheduling = doc.policy.scheduling;
        guard.recovery = doc.policy.recovery;
        guard.max_concurrent = doc.policy.max_concurrent;
        guard.global_timeout = doc.policy.global_timeout_seconds.map(Duration::from_secs);
        Ok(())
    }
}

/// DFS cycle detection over target `prerequisites`, returning the cyclic
/// path if one exists.
fn validate_dependency_graph(targets: &[Target]) -> Result<(), Vec<String>> {
    let graph: HashMap<&str, &Target> = targets.iter().map(|t| (t.name.as_str(), t)).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut cycle_path = Vec::new();

    for name in graph.keys() {
        if !visited.contains(name) && has_cycle_dfs(name, &graph, &mut visited, &mut rec_stack, &mut cycle_path) {
            return Err(cycle_path);
        }
    }
    Ok(())
}

fn has_cycle_dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, &'a Target>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    cycle_path: &mut Vec<String>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    cycle_path.push(node.to_string());

    if let Some(target) = graph.get(node) {
        for dep in &target.prerequisites {
            if !visited.contains(dep.as_str()) {
                if graph.contains_key(dep.as_str()) && has_cycle_dfs(dep.as_str(), graph, visited, rec_stack, cycle_path) {
                    return true;
                }
            } else if rec_stack.contains(dep.as_str()) {
                cycle_path.push(dep.clone());
                return true;
            }
        }
    }

    rec_stack.remove(node);
    cycle_path.pop();
    false
}
