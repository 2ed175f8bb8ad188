//! Check outcomes and the report that accumulates them.
//!
//! A [`HealthReport`] is append-only.  Its [`Summary`] and [`OverallStatus`] are
//! derived on demand, so they always reflect the outcomes recorded so far.
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::*;

/// Result of evaluating a single check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
    /// Not applicable here, e.g. an optional plugin that isn't installed.
    Skip,
}

impl CheckStatus {
    pub const fn as_str(self) -> &'static str {
        use CheckStatus::*;
        match self {
            Pass => "PASS",
            Fail => "FAIL",
            Warn => "WARN",
            Skip => "SKIP",
        }
    }

    /// Ordering used to find the worst outcome.  PASS and SKIP rank equally.
    pub const fn severity(self) -> u8 {
        use CheckStatus::*;
        match self {
            Pass | Skip => 0,
            Warn => 1,
            Fail => 2,
        }
    }

    /// Whether an outcome with this status must explain itself.
    pub const fn needs_reason(self) -> bool {
        matches!(self, CheckStatus::Fail | CheckStatus::Warn)
    }
}

impl Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub category: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Details,
}

impl CheckOutcome {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        status: CheckStatus,
        message: impl Into<String>,
    ) -> Self {
        let mut message = message.into();
        if message.is_empty() && status.needs_reason() {
            message = format!("check reported {} without a reason", status);
        }
        CheckOutcome {
            category: category.into(),
            name: name.into(),
            status,
            message,
            details: Details::new(),
        }
    }

    pub fn with_details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn of<'a>(outcomes: impl IntoIterator<Item = &'a CheckOutcome>) -> Self {
        let mut s = Summary::default();
        for o in outcomes {
            s.total += 1;
            match o.status {
                CheckStatus::Pass => s.passed += 1,
                CheckStatus::Fail => s.failed += 1,
                CheckStatus::Warn => s.warnings += 1,
                CheckStatus::Skip => s.skipped += 1,
            }
        }
        s
    }

    /// Worst case wins: one FAIL makes the cluster CRITICAL no matter what else passed.
    pub fn overall_status(&self) -> OverallStatus {
        if self.failed > 0 {
            OverallStatus::Critical
        } else if self.warnings > 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

impl OverallStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Healthy => "HEALTHY",
            OverallStatus::Degraded => "DEGRADED",
            OverallStatus::Critical => "CRITICAL",
        }
    }

    /// Process exit code scripts rely on.
    pub const fn exit_code(self) -> i32 {
        match self {
            OverallStatus::Healthy => 0,
            OverallStatus::Degraded => 1,
            OverallStatus::Critical => 2,
        }
    }
}

/// Exit code for a run that could not produce a report at all.
pub const ERROR_EXIT_CODE: i32 = 2;

/// Exit code for a finished run: the overall status, or [`ERROR_EXIT_CODE`]
/// if the run failed.
pub fn exit_code(result: &Result<OverallStatus>) -> i32 {
    match result {
        Ok(status) => status.exit_code(),
        Err(_) => ERROR_EXIT_CODE,
    }
}

impl Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer notified every time an outcome is recorded.
pub trait ReportSink {
    fn outcome_recorded(&mut self, outcome: &CheckOutcome);
}

pub struct HealthReport {
    pub timestamp: String,
    pub hostname: String,
    pub tool_version: String,
    pub user: String,
    outcomes: Vec<CheckOutcome>,
    sink: Option<Box<dyn ReportSink>>,
}

impl fmt::Debug for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReport")
            .field("timestamp", &self.timestamp)
            .field("hostname", &self.hostname)
            .field("tool_version", &self.tool_version)
            .field("user", &self.user)
            .field("outcomes", &self.outcomes)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl HealthReport {
    pub fn open(
        hostname: impl Into<String>,
        tool_version: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        HealthReport {
            timestamp: iso_timestamp(),
            hostname: hostname.into(),
            tool_version: tool_version.into(),
            user: user.into(),
            outcomes: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn record(
        &mut self,
        category: &str,
        name: impl Into<String>,
        status: CheckStatus,
        message: impl Into<String>,
        details: Details,
    ) {
        self.push(CheckOutcome::new(category, name, status, message).with_details(details));
    }

    pub fn push(&mut self, outcome: CheckOutcome) {
        log::debug!(
            "recorded {} {}: {}",
            outcome.status,
            outcome.category,
            outcome.name
        );
        if let Some(sink) = self.sink.as_mut() {
            sink.outcome_recorded(&outcome);
        }
        self.outcomes.push(outcome);
    }

    pub fn extend(&mut self, outcomes: impl IntoIterator<Item = CheckOutcome>) {
        for o in outcomes {
            self.push(o);
        }
    }

    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub fn summary(&self) -> Summary {
        Summary::of(&self.outcomes)
    }

    pub fn overall_status(&self) -> OverallStatus {
        self.summary().overall_status()
    }

    pub fn to_document(&self) -> ReportDocument {
        let summary = self.summary();
        ReportDocument {
            timestamp: self.timestamp.clone(),
            hostname: self.hostname.clone(),
            slurm_version: self.tool_version.clone(),
            user: self.user.clone(),
            summary,
            overall_status: summary.overall_status(),
            tests: self.outcomes.clone(),
        }
    }
}

/// Serialized form of a finished report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub timestamp: String,
    pub hostname: String,
    pub slurm_version: String,
    pub user: String,
    pub summary: Summary,
    pub overall_status: OverallStatus,
    pub tests: Vec<CheckOutcome>,
}
