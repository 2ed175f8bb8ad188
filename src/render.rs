//! Turning reports into text for people and JSON for scripts.
use std::io::{IsTerminal, Write};

use crate::baseline::CaptureStep;
use crate::bcm::BcmEnvironment;
use crate::report::{CheckOutcome, CheckStatus, HealthReport, OverallStatus, ReportSink};
use crate::*;

pub const RULE_WIDTH: usize = 65;

/// ANSI escape sequences, or empty strings when colour is off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Palette {
    pub green: &'static str,
    pub yellow: &'static str,
    pub red: &'static str,
    pub cyan: &'static str,
    pub bold: &'static str,
    pub reset: &'static str,
}

impl Palette {
    pub const ANSI: Palette = Palette {
        green: "\x1b[92m",
        yellow: "\x1b[93m",
        red: "\x1b[91m",
        cyan: "\x1b[96m",
        bold: "\x1b[1m",
        reset: "\x1b[0m",
    };

    pub const PLAIN: Palette = Palette {
        green: "",
        yellow: "",
        red: "",
        cyan: "",
        bold: "",
        reset: "",
    };

    /// Colour only when asked for and stdout is a terminal.
    pub fn detect(want_color: bool) -> Self {
        if want_color && std::io::stdout().is_terminal() {
            Palette::ANSI
        } else {
            Palette::PLAIN
        }
    }

    pub fn is_plain(&self) -> bool {
        self.reset.is_empty()
    }

    pub fn status(&self, s: CheckStatus) -> &'static str {
        match s {
            CheckStatus::Pass => self.green,
            CheckStatus::Fail => self.red,
            CheckStatus::Warn => self.yellow,
            CheckStatus::Skip => self.cyan,
        }
    }

    pub fn overall(&self, s: OverallStatus) -> &'static str {
        match s {
            OverallStatus::Healthy => self.green,
            OverallStatus::Degraded => self.yellow,
            OverallStatus::Critical => self.red,
        }
    }

    pub fn rule(&self) -> String {
        format!("{}{}{}", self.bold, "=".repeat(RULE_WIDTH), self.reset)
    }
}

/// The lines printed for one outcome as it is recorded.
///
/// The message is shown for FAIL and WARN, or always when verbose.  Details are
/// only shown when verbose.
pub fn format_outcome(o: &CheckOutcome, palette: &Palette, verbose: bool) -> String {
    let mut s = format!(
        "{}[{}]{} {}: {}",
        palette.status(o.status),
        o.status,
        palette.reset,
        o.category,
        o.name
    );
    if !o.message.is_empty() && (verbose || o.status.needs_reason()) {
        s += &format!("\n  → {}", o.message);
    }
    if verbose {
        for (k, v) in &o.details {
            s += &format!("\n    {}: {}", k, display_value(v));
        }
    }
    s
}

/// Strings without their JSON quotes, everything else as compact JSON.
pub fn display_value(v: &JsonValue) -> String {
    match v {
        JsonValue::String(s) => s.clone(),
        v => v.to_string(),
    }
}

/// Prints every outcome to stdout as soon as it is recorded.
pub struct ConsoleSink {
    palette: Palette,
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(palette: Palette, verbose: bool) -> Self {
        ConsoleSink { palette, verbose }
    }
}

impl ReportSink for ConsoleSink {
    fn outcome_recorded(&mut self, outcome: &CheckOutcome) {
        println!("{}", format_outcome(outcome, &self.palette, self.verbose));
    }
}

pub fn format_capture_step(step: &CaptureStep, palette: &Palette) -> String {
    match step {
        CaptureStep::Captured(what) => format!("{}✓{} Captured {}", palette.green, palette.reset, what),
        CaptureStep::Failed(what) => format!("{}✗{} Failed to capture {}", palette.red, palette.reset, what),
    }
}

pub fn print_header(palette: &Palette, env: &BcmEnvironment, slurm_version: Option<&str>) {
    println!();
    println!("{}", palette.rule());
    println!("{}SLURM CLUSTER HEALTHCHECK (BCM Environment){}", palette.bold, palette.reset);
    println!("{}", palette.rule());
    println!("Timestamp: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Hostname: {}", hostname());
    println!("User: {}", current_user());
    if let Some(v) = env.version {
        println!("BCM Version: {}.x", v);
    }
    if let Some(p) = &env.slurm_base_path {
        println!("Slurm Base Path: {}", p.display());
    }
    if !env.controller_nodes.is_empty() {
        println!("Controller Node(s): {}", env.controller_nodes.join(", "));
    }
    if let Some(v) = slurm_version {
        println!("Slurm Version: {}", v);
    }
    println!("{}", palette.rule());
    println!();
}

pub fn summary_table(report: &HealthReport, palette: &Palette) -> comfy_table::Table {
    use comfy_table::*;

    let s = report.summary();
    let mut t = Table::new();
    t.set_header(vec!["Result", "Count"]);
    let rows = [
        ("Total Tests", s.total, None),
        ("Passed", s.passed, Some(Color::Green)),
        ("Failed", s.failed, Some(Color::Red)),
        ("Warnings", s.warnings, Some(Color::Yellow)),
        ("Skipped", s.skipped, Some(Color::Cyan)),
    ];
    for (label, n, color) in rows {
        let mut label = Cell::new(label);
        if let (Some(c), false) = (color, palette.is_plain()) {
            label = label.fg(c);
        }
        t.add_row(vec![label, Cell::new(n)]);
    }
    t
}

pub fn print_summary(report: &HealthReport, palette: &Palette) {
    let overall = report.overall_status();
    println!();
    println!("{}", palette.rule());
    println!("{}SUMMARY{}", palette.bold, palette.reset);
    println!("{}", palette.rule());
    println!("{}", summary_table(report, palette));
    println!();
    println!(
        "{}Overall Status: {}{}{}",
        palette.bold,
        palette.overall(overall),
        overall,
        palette.reset
    );
    println!("{}", palette.rule());
    println!();
}

/// Plain-text report written by `--output` without `--json`.
pub fn write_text_report(report: &HealthReport, mut w: impl Write) -> std::io::Result<()> {
    writeln!(w, "Slurm Healthcheck Results")?;
    writeln!(w, "{}", "=".repeat(RULE_WIDTH))?;
    writeln!(w, "Timestamp: {}", report.timestamp)?;
    writeln!(w, "Hostname: {}", report.hostname)?;
    writeln!(w, "Slurm Version: {}", report.tool_version)?;
    writeln!(w, "User: {}", report.user)?;
    writeln!(w)?;

    for o in report.outcomes() {
        writeln!(w, "[{}] {}: {}", o.status, o.category, o.name)?;
        if !o.message.is_empty() {
            writeln!(w, "  {}", o.message)?;
        }
        for (k, v) in &o.details {
            writeln!(w, "    {}: {}", k, display_value(v))?;
        }
        writeln!(w)?;
    }

    let s = report.summary();
    writeln!(w)?;
    writeln!(w, "Summary:")?;
    writeln!(w, "  Total: {}", s.total)?;
    writeln!(w, "  Passed: {}", s.passed)?;
    writeln!(w, "  Failed: {}", s.failed)?;
    writeln!(w, "  Warnings: {}", s.warnings)?;
    writeln!(w, "  Skipped: {}", s.skipped)?;
    writeln!(w)?;
    writeln!(w, "Overall Status: {}", s.overall_status())?;
    Ok(())
}

pub fn write_json_report(report: &HealthReport, w: impl Write) -> Result<()> {
    serde_json::to_writer_pretty(w, &report.to_document()).context("failed to serialize report")
}
