//! Script Manager and Script Analyzer (components D and E): registration,
//! versioning, execution, and static safety analysis of named scripts.

mod analyzer;
mod manager;

pub use analyzer::{AnalyzeOptions, AnalyzeResult, Danger, ScriptAnalyzer};
pub use manager::{
    Condition, PostHook, PreHook, RetryStrategy, RunOutcome, ScriptInfo, ScriptKind, ScriptManager,
    ScriptManagerConfig, ABORT_EXIT_CODE,
};
