//! Execution logs recorded per node.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::graph::DependencyNode;
use crate::value::ValueSpecification;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Something was off but outputs were produced.
    Warning,
    /// Outputs could not be produced.
    Error,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
}

/// How much detail to keep for a node's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionLogMode {
    /// Only the set of levels seen.
    #[default]
    Indicators,
    /// Every event.
    Full,
}

/// Log of one node execution.
///
/// In [`ExecutionLogMode::Indicators`] mode only the levels are kept and
/// [`events`](Self::events) returns `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionLog {
    levels: BTreeSet<LogLevel>,
    events: Option<Vec<LogEvent>>,
    exception: Option<String>,
}

impl ExecutionLog {
    /// Create an empty log recording at `mode` detail.
    pub fn new(mode: ExecutionLogMode) -> Self {
        Self {
            levels: BTreeSet::new(),
            events: match mode {
                ExecutionLogMode::Indicators => None,
                ExecutionLogMode::Full => Some(Vec::new()),
            },
            exception: None,
        }
    }

    /// Record an event.
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        self.levels.insert(level);
        if let Some(events) = &mut self.events {
            events.push(LogEvent {
                level,
                message: message.into(),
            });
        }
    }

    /// Record the failure that stopped the function.
    pub fn set_exception(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.push(LogLevel::Error, message.clone());
        self.exception = Some(message);
    }

    /// Levels seen.
    pub fn levels(&self) -> &BTreeSet<LogLevel> {
        &self.levels
    }

    /// Highest level seen.
    pub fn max_level(&self) -> Option<LogLevel> {
        self.levels.iter().next_back().copied()
    }

    /// Recorded events, if the log was kept in full.
    pub fn events(&self) -> Option<&[LogEvent]> {
        self.events.as_deref()
    }

    /// Failure message, if the function failed.
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Returns `true` if the function failed.
    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }
}

impl fmt::Display for ExecutionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_level() {
            Some(level) => write!(f, "{:?}", level)?,
            None => f.write_str("-")?,
        }
        if let Some(exception) = &self.exception {
            write!(f, " ({})", exception)?;
        }
        Ok(())
    }
}

/// Chooses the log mode for each node.
pub trait ExecutionLogModeSource: Send + Sync {
    /// Log mode for `node` in `configuration`.
    fn mode(&self, configuration: &str, node: &DependencyNode) -> ExecutionLogMode;
}

/// The same mode for every node.
impl ExecutionLogModeSource for ExecutionLogMode {
    fn mode(&self, _configuration: &str, _node: &DependencyNode) -> ExecutionLogMode {
        *self
    }
}

/// Full logs for nodes producing selected outputs, indicators elsewhere.
#[derive(Debug, Default)]
pub struct FullLogForOutputs {
    outputs: RwLock<HashSet<ValueSpecification>>,
}

impl FullLogForOutputs {
    /// Create a source with no full-log outputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep full logs for the node producing `spec`.
    pub fn enable(&self, spec: ValueSpecification) {
        self.outputs.write().insert(spec);
    }

    /// Go back to indicators for the node producing `spec`.
    pub fn disable(&self, spec: &ValueSpecification) {
        self.outputs.write().remove(spec);
    }
}

impl ExecutionLogModeSource for FullLogForOutputs {
    fn mode(&self, _configuration: &str, node: &DependencyNode) -> ExecutionLogMode {
        let outputs = self.outputs.read();
        if node.outputs().iter().any(|o| outputs.contains(o)) {
            ExecutionLogMode::Full
        } else {
            ExecutionLogMode::Indicators
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indicators_drop_events() {
        let mut log = ExecutionLog::new(ExecutionLogMode::Indicators);
        log.push(LogLevel::Warning, "stale fixing");
        assert_eq!(log.events(), None);
        assert_eq!(log.max_level(), Some(LogLevel::Warning));
    }

    #[test]
    fn test_full_log_keeps_events() {
        let mut log = ExecutionLog::new(ExecutionLogMode::Full);
        log.push(LogLevel::Info, "started");
        log.set_exception("division by zero");
        let events = log.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].level, LogLevel::Error);
        assert_eq!(log.exception(), Some("division by zero"));
        assert_eq!(log.to_string(), "Error (division by zero)");
    }
}
