//! Static inspection of script text for dangerous shell/PowerShell patterns.
//!
//! Stateless analysis over a configurable rule table, in the shape of
//! `taskdaemon`'s `validation::rule_of_five` (a small enum-and-table-driven
//! pass definition with no mutable state beyond bookkeeping) repurposed
//! here for regex-based danger detection instead of review-pass metadata.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// One dangerous-pattern finding.
#[derive(Debug, Clone, Serialize)]
pub struct Danger {
    pub category: String,
    pub matched_command: String,
    pub reason: String,
    pub line: usize,
    pub context: Option<String>,
}

/// Result of analyzing one script body.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub is_valid: bool,
    pub dangers: Vec<Danger>,
    pub complexity: i64,
    pub execution_time: Duration,
    pub timeout_occurred: bool,
    pub safe_version: String,
}

/// A `{pattern, category}` rule entry, as loaded from an analyzer config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct RuleDef {
    pattern: String,
    category: String,
}

struct Rule {
    regex: Regex,
    category: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    pub timeout: Option<Duration>,
}

struct Stats {
    total_analyzed: u64,
    total_time: Duration,
}

/// Default dangerous-pattern rule set: destructive filesystem operations,
/// fork bombs, and piping a remote script straight into a shell.
fn default_rules() -> Vec<Rule> {
    let specs: &[(&str, &str)] = &[
        (r"rm\s+-rf\s+/(\s|$)", "filesystem-destruction"),
        (r"rm\s+-rf\s+/\*", "filesystem-destruction"),
        (r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:", "fork-bomb"),
        (r"curl[^|]*\|\s*(sh|bash)", "remote-code-execution"),
        (r"wget[^|]*\|\s*(sh|bash)", "remote-code-execution"),
        (r"mkfs\.\w+", "filesystem-destruction"),
        (r">\s*/dev/sd[a-z]", "filesystem-destruction"),
        (r"dd\s+.*of=/dev/", "filesystem-destruction"),
    ];
    specs
        .iter()
        .map(|(pattern, category)| Rule {
            regex: Regex::new(pattern).expect("default pattern must compile"),
            category: category.to_string(),
        })
        .collect()
}

/// Inspects script text for dangerous constructs against a rule table.
pub struct ScriptAnalyzer {
    rules: RwLock<Vec<Rule>>,
    stats: RwLock<Stats>,
}

impl ScriptAnalyzer {
    pub fn new() -> Self {
        debug!("ScriptAnalyzer::new: called");
        Self {
            rules: RwLock::new(default_rules()),
            stats: RwLock::new(Stats {
                total_analyzed: 0,
                total_time: Duration::ZERO,
            }),
        }
    }

    /// Append a new pattern. Errors if the regex fails to compile.
    pub fn add_pattern(&self, pattern: &str, category: impl Into<String>) -> CoreResult<()> {
        debug!(%pattern, "ScriptAnalyzer::add_pattern: called");
        let regex = Regex::new(pattern).map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
        self.rules.write().unwrap().push(Rule {
            regex,
            category: category.into(),
        });
        Ok(())
    }

    /// Replace the rule set from a JSON file of `{pattern, category}` entries.
    pub fn update_config(&self, path: &std::path::Path) -> CoreResult<()> {
        debug!(?path, "ScriptAnalyzer::update_config: called");
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidArgument(format!("reading analyzer config: {e}")))?;
        let defs: Vec<RuleDef> =
            serde_json::from_str(&text).map_err(|e| CoreError::InvalidArgument(format!("parsing analyzer config: {e}")))?;

        let mut rules = Vec::with_capacity(defs.len());
        for def in defs {
            let regex = Regex::new(&def.pattern).map_err(|e| CoreError::InvalidArgument(e.to_string()))?;
            rules.push(Rule {
                regex,
                category: def.category,
            });
        }
        *self.rules.write().unwrap() = rules;
        Ok(())
    }

    /// Full analysis: dangers, a structural complexity metric, and a
    /// commented-out safe rendering of the input.
    pub fn analyze(&self, text: &str, options: AnalyzeOptions) -> AnalyzeResult {
        debug!(len = text.len(), "ScriptAnalyzer::analyze: called");
        let started = Instant::now();
        let deadline = options.timeout.map(|t| started + t);

        let mut dangers = Vec::new();
        let mut timeout_occurred = false;
        let rules = self.rules.read().unwrap();

        'lines: for (idx, line) in text.lines().enumerate() {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                timeout_occurred = true;
                break 'lines;
            }
            for rule in rules.iter() {
                if let Some(matched) = rule.regex.find(line) {
                    dangers.push(Danger {
                        category: rule.category.clone(),
                        matched_command: matched.as_str().to_string(),
                        reason: format!("matches dangerous pattern category '{}'", rule.category),
                        line: idx + 1,
                        context: Some(line.to_string()),
                    });
                }
            }
        }
        drop(rules);

        let complexity = structural_complexity(text);
        let safe_version = self.safe_version(text);
        let execution_time = started.elapsed();

        {
            let mut stats = self.stats.write().unwrap();
            stats.total_analyzed += 1;
            stats.total_time += execution_time;
        }

        AnalyzeResult {
            is_valid: dangers.is_empty(),
            dangers,
            complexity,
            execution_time,
            timeout_occurred,
            safe_version,
        }
    }

    pub fn validate(&self, text: &str) -> bool {
        self.analyze(text, AnalyzeOptions::default()).is_valid
    }

    /// Comment out every line that matches a rule; everything else is
    /// returned verbatim.
    pub fn safe_version(&self, text: &str) -> String {
        let rules = self.rules.read().unwrap();
        text.lines()
            .map(|line| {
                if rules.iter().any(|r| r.regex.is_match(line)) {
                    format!("# {line}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> (u64, Duration) {
        let stats = self.stats.read().unwrap();
        let avg = if stats.total_analyzed > 0 {
            stats.total_time / stats.total_analyzed as u32
        } else {
            Duration::ZERO
        };
        (stats.total_analyzed, avg)
    }
}

impl Default for ScriptAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Line count plus a nesting proxy (count of block-opening keywords/braces).
fn structural_complexity(text: &str) -> i64 {
    let line_count = text.lines().count() as i64;
    let nesting_proxy = text
        .split(|c: char| c.is_whitespace() || c == '{' || c == '}')
        .filter(|token| matches!(*token, "if" | "for" | "while" | "case" | "function" | "{"))
        .count() as i64;
    line_count + nesting_proxy
}
