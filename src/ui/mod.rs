use anyhow::Error;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::{
    ExecutionEvent, Finding, RiskLevel, ScanReport, SessionReport, SessionState, Severity,
    StepOutcome,
};

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub stdin_is_tty: bool,
    pub stdout_is_tty: bool,
    pub stderr_is_tty: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "error:");
    let _ = writeln!(stderr, "  {err}");

    let mut causes = err.chain().skip(1).peekable();
    if causes.peek().is_some() {
        let _ = writeln!(stderr, "caused by:");
        for cause in causes {
            let _ = writeln!(stderr, "  - {cause}");
        }
    }

    let _ = writeln!(stderr, "next:");
    let _ = writeln!(stderr, "  - re-run with `--verbose` for more detail");
    let _ = writeln!(
        stderr,
        "  - see `bootmend --help` for the available commands and options"
    );
}

pub fn print_scan(report: &ScanReport, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "target: {}  environment: {}  firmware: {}  elevated: {}",
        report.target,
        report.environment.kind.as_str(),
        report.environment.firmware,
        report.environment.elevated
    );
    let _ = writeln!(out);
    if report.findings.is_empty() {
        let _ = writeln!(out, "No boot problems found.");
    } else {
        let _ = writeln!(out, "Findings ({}):", report.findings.len());
        print_findings_table(&mut out, &report.findings, cfg.color, cfg.verbose);
    }
    if !report.probe_errors.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Inconclusive checks (not treated as healthy):");
        for err in &report.probe_errors {
            let _ = writeln!(out, "- {} [{}]: {}", err.probe, err.kind, err.detail);
        }
    }
}

/// Renders the step previews of a dry run, scheduled tiers first.
pub fn print_preview(events: &[ExecutionEvent], cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let mut any = false;
    let mut last_tier = None;
    let mut fallback_header = false;
    for event in events {
        let ExecutionEvent::Preview {
            tier,
            step_id,
            command,
            risk,
            fallback,
        } = event
        else {
            continue;
        };
        any = true;
        if *fallback && !fallback_header {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Fallback tiers (only entered if verification still fails):"
            );
            fallback_header = true;
        }
        if last_tier != Some(*tier) {
            let _ = writeln!(out, "{}:", capitalize(&tier.to_string()));
            last_tier = Some(*tier);
        }
        let _ = writeln!(
            out,
            "  [{}] {}",
            pad_end_ansi(&format_risk(*risk, cfg.color), 2),
            step_id
        );
        let _ = writeln!(out, "       {command}");
    }
    if !any {
        let _ = writeln!(out, "Nothing to repair.");
    }
}

pub fn print_event(event: &ExecutionEvent, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut err = io::stderr().lock();
    match event {
        ExecutionEvent::Transition { to, .. } => {
            if cfg.verbose || matches!(to, SessionState::ExecutingTier(_)) {
                let _ = writeln!(err, "== {to}");
            }
        }
        ExecutionEvent::ProbeInconclusive { probe, detail } => {
            let _ = writeln!(err, "inconclusive: {probe}: {detail}");
        }
        ExecutionEvent::Confirmation { granted, .. } => {
            if !granted {
                let _ = writeln!(err, "Cancelled.");
            }
        }
        ExecutionEvent::Preview { .. } => {}
        ExecutionEvent::StepSkipped { step_id, reason, .. } => {
            let _ = writeln!(err, "  skip {step_id}: {reason}");
        }
        ExecutionEvent::BackupCompleted {
            step_id, artifact, ..
        } => {
            let _ = writeln!(err, "  backup for {step_id}: {artifact}");
        }
        ExecutionEvent::CommandFinished {
            command,
            exit_code,
            error,
            ..
        } => {
            let status = match (exit_code, error) {
                (_, Some(e)) => e.clone(),
                (Some(code), None) => format!("exit {code}"),
                (None, None) => "no exit code".to_string(),
            };
            let _ = writeln!(err, "  $ {command}  ({status})");
        }
        ExecutionEvent::TierSkipped { tier, reason } => {
            let _ = writeln!(err, "== {tier} skipped: {reason}");
        }
        ExecutionEvent::TierFailed { tier, failure } => {
            let _ = writeln!(err, "== {tier} failed: {failure}");
        }
        ExecutionEvent::Verification {
            finding_id,
            resolved,
            detail,
            ..
        } => {
            let mark = if *resolved { "ok" } else { "still broken" };
            let _ = writeln!(err, "  verify {finding_id}: {mark} ({detail})");
        }
        ExecutionEvent::Result(result) => {
            if cfg.verbose {
                let outcome = match result.outcome {
                    StepOutcome::Success => "success",
                    StepOutcome::Failed => "failed",
                    StepOutcome::Inconclusive => "inconclusive",
                };
                let _ = writeln!(err, "  result {}: {outcome}", result.step_id);
            }
        }
    }
}

pub fn print_report(report: &SessionReport, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }
    let mut out = io::stdout().lock();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Session {} on {}: {}",
        report.session_id, report.target, report.state
    );
    if !report.resolved.is_empty() {
        let _ = writeln!(out, "Resolved: {}", report.resolved.join(", "));
    }
    if !report.false_positives.is_empty() {
        let _ = writeln!(
            out,
            "Reported success but verification disagreed: {}",
            report.false_positives.join(", ")
        );
    }
    if !report.remaining_issues.is_empty() {
        let _ = writeln!(out, "Remaining issues:");
        print_findings_table(&mut out, &report.remaining_issues, cfg.color, false);
    }
    if let Some(hypothesis) = &report.root_cause_hypothesis {
        let _ = writeln!(out);
        let _ = writeln!(out, "Likely cause: {hypothesis}");
    }
    if !report.manual_commands.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Manual commands:");
        for cmd in &report.manual_commands {
            let _ = writeln!(out, "  {cmd}");
        }
    }
    for note in &report.notes {
        let _ = writeln!(out, "- {note}");
    }
}

fn print_findings_table(out: &mut dyn Write, findings: &[Finding], color: bool, evidence: bool) {
    let label_sev = "SEVERITY";
    let label_conf = "CONF";
    let label_id = "ID";
    let label_title = "TITLE";

    let sev_w = visible_width_ansi(label_sev);
    let conf_w = visible_width_ansi(label_conf);
    let id_w = findings
        .iter()
        .map(|f| visible_width_ansi(&truncate_middle(&f.id, 40)))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_id));
    let title_w = visible_width_ansi(label_title).max(5);

    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        pad_end_display(label_sev, sev_w),
        pad_start_display(label_conf, conf_w),
        pad_end_display(label_id, id_w),
        label_title
    );
    let _ = writeln!(
        out,
        "{}  {}  {}  {}",
        "-".repeat(sev_w),
        "-".repeat(conf_w),
        "-".repeat(id_w),
        "-".repeat(title_w)
    );

    for finding in findings {
        let sev = pad_end_ansi(&format_severity(finding.severity, color), sev_w);
        let conf = pad_start_display(&finding.confidence.to_string(), conf_w);
        let id = pad_end_display(&truncate_middle(&finding.id, 40), id_w);
        let _ = writeln!(out, "{sev}  {conf}  {id}  {}", finding.title);
        if evidence {
            for e in &finding.evidence {
                let _ = writeln!(out, "{}  - {}", " ".repeat(sev_w + conf_w + 4), e.summary());
            }
        }
    }
}

fn truncate_middle(s: &str, max_chars: usize) -> String {
    let len = s.chars().count();
    if len <= max_chars {
        return s.to_string();
    }

    let keep = max_chars.saturating_sub(3);
    let left = keep / 2;
    let right = keep.saturating_sub(left);

    let prefix: String = s.chars().take(left).collect();
    let suffix: String = s.chars().skip(len - right).collect();

    format!("{prefix}...{suffix}")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn format_severity(severity: Severity, color: bool) -> String {
    let s = severity.as_str();
    if !color {
        return s.to_string();
    }
    let code = match severity {
        Severity::Critical => "31",
        Severity::Warning => "33",
        Severity::Info => "90",
    };
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn format_risk(risk: RiskLevel, color: bool) -> String {
    let s = risk.as_str();
    if !color {
        return s.to_string();
    }

    let code = match risk {
        RiskLevel::R0 => "90",
        RiskLevel::R1 => "32",
        RiskLevel::R2 => "33",
        RiskLevel::R3 => "31",
    };
    format!("\x1b[{code}m{s}\x1b[0m")
}

fn pad_end_ansi(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_end_display(s: &str, width: usize) -> String {
    pad_end_ansi(s, width)
}

fn pad_start_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{}{}", " ".repeat(width - w), s)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}
