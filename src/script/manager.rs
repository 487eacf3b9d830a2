//! The Script Manager: registry, versioning, and execution of named scripts.
//!
//! Modeled on `taskdaemon`'s `tools::executor::ToolExecutor` registry shape
//! (`HashMap<String, _>` behind a lock, `has_tool`/`tool_names` style
//! introspection) and `tools::builtin::run_command::RunCommandTool`'s
//! spawn-with-timeout idiom (`tokio::process::Command`, truncated captured
//! output), extended with a streaming line reader that polls an abort flag
//! and parses `PROGRESS:<float>` lines, plus the per-script condition gate
//! from `original_source/src/script/sheller.hpp`'s `setScriptCondition`.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::analyzer::{AnalyzeOptions, ScriptAnalyzer};
use crate::error::{CoreError, CoreResult};

/// Exit code reserved for a run terminated by the abort flag.
pub const ABORT_EXIT_CODE: i32 = -999;

const OUTPUT_RING_CAPACITY: usize = 2_000;
const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScriptKind {
    Shell,
    PowerShell,
}

impl std::str::FromStr for ScriptKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            "powershell" | "ps1" | "ps" => Ok(Self::PowerShell),
            other => Err(CoreError::DefinitionError(format!(
                "unknown script kind '{other}', expected 'shell' or 'powershell'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Aborted,
    Failed,
}

/// Retry strategy applied between failed attempts of `run`.
#[derive(Clone)]
pub enum RetryStrategy {
    None,
    Linear(Duration),
    Exponential(Duration),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryStrategy {
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Linear(base) => *base * (attempt + 1),
            RetryStrategy::Exponential(base) => *base * 2u32.saturating_pow(attempt),
            RetryStrategy::Custom(f) => f(attempt),
        }
    }
}

pub type PreHook = Arc<dyn Fn(&str) + Send + Sync + 'static>;
pub type PostHook = Arc<dyn Fn(&str, i32) + Send + Sync + 'static>;
pub type Condition = Arc<dyn Fn(&HashMap<String, String>) -> bool + Send + Sync + 'static>;

struct Hooks {
    pre: Vec<PreHook>,
    post: Vec<PostHook>,
}

struct ScriptEntry {
    kind: ScriptKind,
    env: HashMap<String, String>,
    versions: VecDeque<String>,
    current_version_idx: usize,
    versioning_enabled: bool,
    condition: Option<Condition>,
    abort_flag: Arc<AtomicBool>,
}

impl ScriptEntry {
    fn body(&self) -> &str {
        &self.versions[self.current_version_idx]
    }
}

/// Snapshot returned by `info(name)`.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptInfo {
    pub name: String,
    pub kind: ScriptKind,
    pub version_count: usize,
    pub current_version_idx: usize,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub output: String,
    pub exit_code: i32,
}

struct Execution {
    status: ExecutionStatus,
    progress: f64,
    output_ring: VecDeque<String>,
    exit_code: Option<i32>,
    start: Instant,
    end: Option<Instant>,
}

impl Execution {
    fn new() -> Self {
        Self {
            status: ExecutionStatus::Queued,
            progress: 0.0,
            output_ring: VecDeque::new(),
            exit_code: None,
            start: Instant::now(),
            end: None,
        }
    }

    fn push_output(&mut self, line: String) {
        if self.output_ring.len() == OUTPUT_RING_CAPACITY {
            self.output_ring.pop_front();
        }
        self.output_ring.push_back(line);
    }
}

pub struct ScriptManagerConfig {
    pub max_versions: usize,
    pub concurrency_limit: usize,
}

impl Default for ScriptManagerConfig {
    fn default() -> Self {
        Self {
            max_versions: 10,
            concurrency_limit: 4,
        }
    }
}

/// Registry, version history, and execution engine for named scripts.
pub struct ScriptManager {
    scripts: RwLock<HashMap<String, ScriptEntry>>,
    executions: RwLock<HashMap<String, Execution>>,
    hooks: RwLock<HashMap<String, Hooks>>,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
    analyzer: Arc<ScriptAnalyzer>,
    concurrency: Semaphore,
    max_versions: usize,
}

impl ScriptManager {
    pub fn new(analyzer: Arc<ScriptAnalyzer>, config: ScriptManagerConfig) -> Self {
        debug!("ScriptManager::new: called");
        Self {
            scripts: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            analyzer,
            concurrency: Semaphore::new(config.concurrency_limit),
            max_versions: config.max_versions,
        }
    }

    async fn log_line(&self, name: &str, line: impl Into<String>) {
        let mut guard = self.logs.write().await;
        let buffer = guard.entry(name.to_string()).or_default();
        if buffer.len() == LOG_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(line.into());
    }

    pub async fn register(&self, name: impl Into<String>, body: impl Into<String>, kind: ScriptKind) -> CoreResult<()> {
        let name = name.into();
        debug!(%name, "ScriptManager::register: called");
        let mut guard = self.scripts.write().await;
        if guard.contains_key(&name) {
            return Err(CoreError::InvalidArgument(format!("script '{name}' already registered")));
        }
        let mut versions = VecDeque::new();
        versions.push_back(body.into());
        guard.insert(
            name.clone(),
            ScriptEntry {
                kind,
                env: HashMap::new(),
                versions,
                current_version_idx: 0,
                versioning_enabled: false,
                condition: None,
                abort_flag: Arc::new(AtomicBool::new(false)),
            },
        );
        self.log_line(&name, "registered").await;
        Ok(())
    }

    /// Register a script read from disk; `kind` inferred from the file
    /// extension when not given explicitly.
    pub async fn register_from_file(
        &self,
        name: impl Into<String>,
        path: &Path,
        kind: Option<ScriptKind>,
    ) -> CoreResult<()> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidArgument(format!("reading script file: {e}")))?;
        let kind = match kind {
            Some(k) => k,
            None => match path.extension().and_then(|e| e.to_str()) {
                Some("ps1") => ScriptKind::PowerShell,
                Some("sh") | _ => ScriptKind::Shell,
            },
        };
        self.register(name, body, kind).await
    }

    pub async fn enable_versioning(&self, name: &str) -> CoreResult<()> {
        let mut guard = self.scripts.write().await;
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        entry.versioning_enabled = true;
        Ok(())
    }

    pub async fn set_condition(&self, name: &str, condition: Condition) -> CoreResult<()> {
        let mut guard = self.scripts.write().await;
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        entry.condition = Some(condition);
        Ok(())
    }

    pub async fn set_env(&self, name: &str, env: HashMap<String, String>) -> CoreResult<()> {
        let mut guard = self.scripts.write().await;
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        entry.env = env;
        Ok(())
    }

    /// Update a script's body. If versioning is enabled, appends a new
    /// version (FIFO-evicting the oldest past `max_versions`); otherwise
    /// overwrites the single current version in place.
    pub async fn update(&self, name: &str, body: impl Into<String>) -> CoreResult<()> {
        debug!(%name, "ScriptManager::update: called");
        let mut guard = self.scripts.write().await;
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;

        if entry.versioning_enabled {
            if entry.versions.len() == self.max_versions {
                entry.versions.pop_front();
                entry.current_version_idx = entry.current_version_idx.saturating_sub(1);
            }
            entry.versions.push_back(body.into());
            entry.current_version_idx = entry.versions.len() - 1;
        } else {
            let idx = entry.current_version_idx;
            entry.versions[idx] = body.into();
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> CoreResult<()> {
        debug!(%name, "ScriptManager::delete: called");
        let mut guard = self.scripts.write().await;
        guard
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        self.hooks.write().await.remove(name);
        self.logs.write().await.remove(name);
        self.executions.write().await.remove(name);
        Ok(())
    }

    /// Roll back to a 0-indexed past version.
    pub async fn rollback(&self, name: &str, version: usize) -> CoreResult<()> {
        debug!(%name, version, "ScriptManager::rollback: called");
        let mut guard = self.scripts.write().await;
        let entry = guard
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        if version >= entry.versions.len() {
            return Err(CoreError::NotFound(format!("version {version} of script '{name}'")));
        }
        entry.current_version_idx = version;
        Ok(())
    }

    pub async fn add_pre_hook(&self, name: &str, hook: PreHook) {
        let mut guard = self.hooks.write().await;
        guard.entry(name.to_string()).or_insert_with(|| Hooks { pre: Vec::new(), post: Vec::new() }).pre.push(hook);
    }

    pub async fn add_post_hook(&self, name: &str, hook: PostHook) {
        let mut guard = self.hooks.write().await;
        guard.entry(name.to_string()).or_insert_with(|| Hooks { pre: Vec::new(), post: Vec::new() }).post.push(hook);
    }

    fn render_command_line(kind: ScriptKind, entry_env: &HashMap<String, String>, body: &str, args: &HashMap<String, String>) -> (String, Vec<String>) {
        let mut env_prefix = String::new();
        for (k, v) in entry_env {
            env_prefix.push_str(&format!("{k}={v} "));
        }
        let mut arg_suffix = String::new();
        for (k, v) in args {
            arg_suffix.push_str(&format!(" {k}={v}"));
        }
        let rendered = format!("{env_prefix}{body}{arg_suffix}");
        let invocation = match kind {
            ScriptKind::Shell => vec!["sh".to_string(), "-c".to_string(), rendered],
            ScriptKind::PowerShell => vec!["powershell".to_string(), "-Command".to_string(), rendered],
        };
        (invocation[0].clone(), invocation[1..].to_vec())
    }

    /// Execute a registered script once, honoring the safety gate, hooks,
    /// progress/output streaming, and cooperative abort.
    pub async fn run(
        &self,
        name: &str,
        args: HashMap<String, String>,
        safe: bool,
        timeout: Option<Duration>,
        retries: u32,
        strategy: RetryStrategy,
    ) -> CoreResult<RunOutcome> {
        debug!(%name, safe, retries, "ScriptManager::run: called");

        let mut attempt = 0;
        loop {
            let result = self.run_once(name, args.clone(), safe, timeout).await;
            match &result {
                Ok(outcome) if outcome.exit_code == 0 => return result,
                Ok(outcome) if outcome.exit_code == ABORT_EXIT_CODE => return result,
                Err(_) => return result,
                _ => {}
            }
            if attempt >= retries {
                return result;
            }
            let delay = strategy.delay_for(attempt);
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn run_once(&self, name: &str, args: HashMap<String, String>, safe: bool, timeout: Option<Duration>) -> CoreResult<RunOutcome> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| CoreError::InvalidState("script manager shutting down".into()))?;

        let (kind, env, body, condition, abort_flag) = {
            let guard = self.scripts.read().await;
            let entry = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
            (
                entry.kind,
                entry.env.clone(),
                entry.body().to_string(),
                entry.condition.clone(),
                entry.abort_flag.clone(),
            )
        };

        if let Some(condition) = &condition
            && !condition(&env)
        {
            abort_flag.store(false, Ordering::Release);
            return Err(CoreError::PolicyViolation(format!("script '{name}' condition gate refused execution")));
        }

        if safe {
            let analysis = self.analyzer.analyze(&body, AnalyzeOptions::default());
            if !analysis.is_valid {
                warn!(%name, "ScriptManager::run: safety gate refused execution");
                abort_flag.store(false, Ordering::Release);
                return Err(CoreError::PolicyViolation(format!(
                    "script '{name}' failed safety analysis: {} danger(s) found",
                    analysis.dangers.len()
                )));
            }
        }

        // Intentionally not reset here: an abort() racing ahead of this run
        // (requested before the read loop is even polling) must still be
        // honored once the loop starts, not wiped by a fresh-run reset.
        {
            let hooks = self.hooks.read().await;
            if let Some(h) = hooks.get(name) {
                for hook in &h.pre {
                    hook(name);
                }
            }
        }

        self.executions.write().await.insert(name.to_string(), Execution::new());
        self.set_status(name, ExecutionStatus::Running).await;

        let (program, cmd_args) = Self::render_command_line(kind, &env, &body, &args);
        let spawn_result = Command::new(&program)
            .args(&cmd_args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                self.set_status(name, ExecutionStatus::Failed).await;
                abort_flag.store(false, Ordering::Release);
                return Err(CoreError::HandlerFailed(format!("spawn failed: {e}")));
            }
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();
        let mut captured = String::new();

        let drive = async {
            loop {
                tokio::select! {
                    biased;
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(value) = line.strip_prefix("PROGRESS:")
                                    && let Ok(parsed) = value.trim().parse::<f64>()
                                {
                                    self.set_progress(name, parsed.clamp(0.0, 1.0)).await;
                                }
                                captured.push_str(&line);
                                captured.push('\n');
                                self.push_output(name, line.clone()).await;
                                self.log_line(name, line).await;
                            }
                            Ok(None) => break,
                            Err(e) => return Err(CoreError::HandlerFailed(format!("reading script output: {e}"))),
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        if abort_flag.load(Ordering::Acquire) {
                            let _ = child.kill().await;
                            return Ok(ABORT_EXIT_CODE);
                        }
                    }
                }
            }
            let status = child.wait().await.map_err(|e| CoreError::HandlerFailed(format!("waiting on script: {e}")))?;
            Ok(status.code().unwrap_or(-1))
        };

        let read_result: CoreResult<i32> = match timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    Err(CoreError::Timeout(format!("script '{name}' exceeded its timeout")))
                }
            },
            None => drive.await,
        };

        let exit_code = match read_result {
            Ok(code) => code,
            Err(e) => {
                self.set_status(name, ExecutionStatus::Failed).await;
                abort_flag.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let final_status = if exit_code == ABORT_EXIT_CODE {
            ExecutionStatus::Aborted
        } else if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.finish_execution(name, final_status, exit_code).await;
        abort_flag.store(false, Ordering::Release);

        if exit_code != ABORT_EXIT_CODE {
            let hooks = self.hooks.read().await;
            if let Some(h) = hooks.get(name) {
                for hook in &h.post {
                    hook(&captured, exit_code);
                }
            }
        }
        self.log_line(name, format!("exit_code={exit_code}")).await;

        Ok(RunOutcome {
            output: captured,
            exit_code,
        })
    }

    async fn set_status(&self, name: &str, status: ExecutionStatus) {
        if let Some(exec) = self.executions.write().await.get_mut(name) {
            exec.status = status;
        }
    }

    async fn set_progress(&self, name: &str, progress: f64) {
        if let Some(exec) = self.executions.write().await.get_mut(name) {
            exec.progress = progress;
        }
    }

    async fn push_output(&self, name: &str, line: String) {
        if let Some(exec) = self.executions.write().await.get_mut(name) {
            exec.push_output(line);
        }
    }

    async fn finish_execution(&self, name: &str, status: ExecutionStatus, exit_code: i32) {
        if let Some(exec) = self.executions.write().await.get_mut(name) {
            exec.status = status;
            exec.exit_code = Some(exit_code);
            exec.end = Some(Instant::now());
        }
    }

    /// Run a list of `(name, args)` one at a time.
    pub async fn run_sequentially(
        &self,
        scripts: Vec<(String, HashMap<String, String>)>,
        safe: bool,
        retries: u32,
    ) -> Vec<CoreResult<RunOutcome>> {
        let mut results = Vec::with_capacity(scripts.len());
        for (name, args) in scripts {
            results.push(self.run(&name, args, safe, None, retries, RetryStrategy::None).await);
        }
        results
    }

    /// Run a list of `(name, args)` concurrently, bounded by the manager's
    /// configured concurrency limit (enforced by the shared semaphore each
    /// `run_once` acquires). `join_all` polls every future on this task
    /// rather than spawning, so the `&self` borrow each `run` future holds
    /// never needs to be `'static`.
    pub async fn run_concurrently(
        &self,
        scripts: Vec<(String, HashMap<String, String>)>,
        safe: bool,
        retries: u32,
    ) -> Vec<CoreResult<RunOutcome>> {
        // `async move` gives each future ownership of its own `name`, so the
        // `&name` borrow `run` takes is self-referential (valid) rather than
        // pointing at a variable that belongs to this closure's stack frame.
        let futures = scripts.into_iter().map(|(name, args)| async move {
            self.run(&name, args, safe, None, retries, RetryStrategy::None).await
        });
        join_all(futures).await
    }

    pub async fn abort(&self, name: &str) -> CoreResult<()> {
        debug!(%name, "ScriptManager::abort: called");
        let guard = self.scripts.read().await;
        let entry = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        entry.abort_flag.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn output(&self, name: &str) -> CoreResult<String> {
        let guard = self.executions.read().await;
        let exec = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("execution '{name}'")))?;
        Ok(exec.output_ring.iter().cloned().collect::<Vec<_>>().join("\n"))
    }

    pub async fn exit_code(&self, name: &str) -> CoreResult<Option<i32>> {
        let guard = self.executions.read().await;
        let exec = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("execution '{name}'")))?;
        Ok(exec.exit_code)
    }

    /// Most recently parsed `PROGRESS:` value, clamped to `[0,1]`.
    pub async fn progress(&self, name: &str) -> CoreResult<f64> {
        let guard = self.executions.read().await;
        let exec = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("execution '{name}'")))?;
        Ok(exec.progress.clamp(0.0, 1.0))
    }

    pub async fn logs(&self, name: &str) -> CoreResult<Vec<String>> {
        let guard = self.logs.read().await;
        Ok(guard.get(name).map(|b| b.iter().cloned().collect()).unwrap_or_default())
    }

    pub async fn info(&self, name: &str) -> CoreResult<ScriptInfo> {
        let guard = self.scripts.read().await;
        let entry = guard.get(name).ok_or_else(|| CoreError::NotFound(format!("script '{name}'")))?;
        Ok(ScriptInfo {
            name: name.to_string(),
            kind: entry.kind,
            version_count: entry.versions.len(),
            current_version_idx: entry.current_version_idx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ScriptManager {
        ScriptManager::new(Arc::new(ScriptAnalyzer::new()), ScriptManagerConfig::default())
    }

    #[test]
    fn script_kind_rejects_unknown_strings() {
        use std::str::FromStr;
        assert!(matches!(ScriptKind::from_str("shell"), Ok(ScriptKind::Shell)));
        assert!(matches!(ScriptKind::from_str("powershell"), Ok(ScriptKind::PowerShell)));
        assert!(matches!(ScriptKind::from_str("python"), Err(CoreError::DefinitionError(_))));
    }

    #[tokio::test]
    async fn run_executes_registered_shell_script() {
        let manager = manager();
        manager.register("hello", "echo hello-world", ScriptKind::Shell).await.unwrap();
        let outcome = manager
            .run("hello", HashMap::new(), false, None, 0, RetryStrategy::None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.contains("hello-world"));
    }

    #[tokio::test]
    async fn progress_is_parsed_and_clamped() {
        let manager = manager();
        manager
            .register("progress", "echo PROGRESS:0.5; echo PROGRESS:2.0", ScriptKind::Shell)
            .await
            .unwrap();
        manager.run("progress", HashMap::new(), false, None, 0, RetryStrategy::None).await.unwrap();
        let progress = manager.progress("progress").await.unwrap();
        assert_eq!(progress, 1.0);
    }

    #[tokio::test]
    async fn scenario_s6_safety_gate_blocks_dangerous_script() {
        let manager = manager();
        manager.register("danger", "rm -rf /", ScriptKind::Shell).await.unwrap();
        let result = manager.run("danger", HashMap::new(), true, None, 0, RetryStrategy::None).await;
        assert!(matches!(result, Err(CoreError::PolicyViolation(_))));

        let result = manager.run("danger", HashMap::new(), false, None, 0, RetryStrategy::None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn register_delete_register_yields_identical_entry() {
        // Testable property 10.
        let manager = manager();
        manager.register("s", "echo 1", ScriptKind::Shell).await.unwrap();
        let first = manager.info("s").await.unwrap();
        manager.delete("s").await.unwrap();
        manager.register("s", "echo 1", ScriptKind::Shell).await.unwrap();
        let second = manager.info("s").await.unwrap();
        assert_eq!(first.version_count, second.version_count);
        assert_eq!(first.current_version_idx, second.current_version_idx);
    }

    #[tokio::test]
    async fn versioning_evicts_oldest_past_max() {
        // Testable property 7.
        let manager = ScriptManager::new(
            Arc::new(ScriptAnalyzer::new()),
            ScriptManagerConfig {
                max_versions: 2,
                concurrency_limit: 4,
            },
        );
        manager.register("v", "v0", ScriptKind::Shell).await.unwrap();
        manager.enable_versioning("v").await.unwrap();
        manager.update("v", "v1").await.unwrap();
        manager.update("v", "v2").await.unwrap();

        let info = manager.info("v").await.unwrap();
        assert_eq!(info.version_count, 2);
        // Oldest (v0) evicted; rollback to the earliest remaining index is v1.
        manager.rollback("v", 0).await.unwrap();
    }

    #[tokio::test]
    async fn rollback_missing_version_is_not_found() {
        let manager = manager();
        manager.register("r", "echo", ScriptKind::Shell).await.unwrap();
        let err = manager.rollback("r", 5).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn condition_gate_can_refuse_execution() {
        let manager = manager();
        manager.register("gated", "echo should-not-run", ScriptKind::Shell).await.unwrap();
        manager.set_condition("gated", Arc::new(|_env| false)).await.unwrap();
        let result = manager.run("gated", HashMap::new(), false, None, 0, RetryStrategy::None).await;
        assert!(matches!(result, Err(CoreError::PolicyViolation(_))));
    }

    #[tokio::test]
    async fn abort_produces_reserved_exit_code() {
        let manager = Arc::new(manager());
        manager
            .register("spin", "for i in $(seq 1 50); do echo tick$i; sleep 0.05; done", ScriptKind::Shell)
            .await
            .unwrap();

        let handle = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run("spin", HashMap::new(), false, None, 0, RetryStrategy::None).await })
        };
        // Give the spawned run time to reach its read loop before requesting abort.
        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.abort("spin").await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.exit_code, ABORT_EXIT_CODE);
    }

    #[tokio::test]
    async fn run_sequentially_runs_all_scripts() {
        let manager = manager();
        manager.register("a", "echo a", ScriptKind::Shell).await.unwrap();
        manager.register("b", "echo b", ScriptKind::Shell).await.unwrap();
        let results = manager
            .run_sequentially(vec![("a".to_string(), HashMap::new()), ("b".to_string(), HashMap::new())], false, 0)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
