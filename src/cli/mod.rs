use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::EffectiveConfig;
use crate::core::{ExecutionEvent, SessionMode, SessionState, TargetVolume, Tier};
use crate::engine::{Capabilities, Engine, EngineError};
use crate::logs::{JsonLinesLog, Logger, NullLog};
use crate::ui::UiConfig;

mod prompt;

use prompt::TerminalPrompt;

#[derive(Debug, Parser)]
#[command(
    name = "bootmend",
    version,
    about = "Diagnose boot failures and repair them tier by tier, verifying every fix"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Per-command timeout in seconds for repair commands.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run every read-only probe and list the findings.
    Scan(TargetArgs),
    /// Show the repair ladder without changing anything.
    Plan(TargetArgs),
    /// Preview, or with --apply run, the escalating repair.
    Repair(RepairArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Volume holding the installed system, e.g. C:
    #[arg(long)]
    pub target: String,
}

#[derive(Debug, Args)]
pub struct RepairArgs {
    #[arg(long)]
    pub target: String,
    #[arg(long)]
    pub apply: bool,
    #[arg(long)]
    pub max_tier: Option<u8>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let stdin_is_tty = io::stdin().is_terminal();
    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::platform::effective_home_dir()?;

    let env_config_path = std::env::var_os("BOOTMEND_CONFIG").map(PathBuf::from);
    let mut cfg = crate::config::load(
        cli.config.as_deref().or(env_config_path.as_deref()),
        &home_dir,
    )
    .map_err(crate::exit::invalid_args_err)?;

    if let Some(secs) = cli.timeout {
        if secs == 0 {
            return Err(crate::exit::invalid_args("--timeout must be at least 1"));
        }
        cfg.command.timeout_secs = secs;
    }

    let color = stdout_is_tty && cfg.ui.color && !cli.no_color;

    let ui_cfg = UiConfig {
        color,
        stdin_is_tty,
        stdout_is_tty,
        stderr_is_tty,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Scan(args) => {
            let target = parse_target(&args.target)?;
            let engine = build_engine(&cfg, Arc::new(NullLog));
            let (env, outcome) = engine.scan(&target);
            let report = outcome.report(&target, &env, now_rfc3339());
            if cli.json {
                write_json(&report)?;
            } else {
                crate::ui::print_scan(&report, &ui_cfg);
            }
        }
        Commands::Plan(args) => {
            let target = parse_target(&args.target)?;
            let engine = build_engine(&cfg, Arc::new(NullLog));
            preview(&engine, target, &ui_cfg, cli.json)?;
        }
        Commands::Repair(args) => {
            let target = parse_target(&args.target)?;
            if let Some(n) = args.max_tier {
                cfg.repair.max_tier = Tier::new(n).ok_or_else(|| {
                    crate::exit::invalid_args(format!(
                        "--max-tier must be between {} and {}",
                        Tier::MIN.get(),
                        Tier::MAX.get()
                    ))
                })?;
            }
            if !args.apply {
                let engine = build_engine(&cfg, Arc::new(NullLog));
                preview(&engine, target, &ui_cfg, cli.json)?;
                if !cli.json && !ui_cfg.quiet {
                    eprintln!("dry run: nothing was changed; re-run with --apply to repair");
                }
                return Ok(());
            }
            if !(ui_cfg.stdin_is_tty && ui_cfg.stderr_is_tty) {
                return Err(crate::exit::invalid_args(
                    "repair --apply needs an interactive terminal (stdin + stderr) for confirmation",
                ));
            }
            repair(&cfg, &home_dir, target, &ui_cfg, cli.json)?;
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "bootmend", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: use `bootmend config --show`");
            }
        }
    }

    Ok(())
}

fn build_engine(cfg: &EffectiveConfig, logger: Arc<dyn Logger>) -> Engine {
    Engine::new(
        cfg.engine_settings(),
        Capabilities::host(cfg.host_environment(), Arc::new(TerminalPrompt), logger),
    )
}

fn parse_target(input: &str) -> Result<TargetVolume> {
    TargetVolume::new(input).ok_or_else(|| {
        crate::exit::engine_err(EngineError::InvalidTarget {
            input: input.to_string(),
        })
    })
}

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
    session_id: &'a str,
    target: &'a TargetVolume,
    findings: &'a [crate::core::Finding],
    scheduled: &'a [crate::core::PlannedTier],
    fallback: &'a [crate::core::PlannedTier],
    confirmation: crate::core::Confirmation,
    previews: &'a [ExecutionEvent],
}

/// A dry-run session: scans, plans, and previews every step without running any.
fn preview(engine: &Engine, target: TargetVolume, ui_cfg: &UiConfig, json: bool) -> Result<()> {
    let handle = engine
        .start_session(target, SessionMode::DryRun)
        .map_err(crate::exit::engine_err)?;
    let plan = engine.plan(&handle);
    let fallback = engine.fallback_preview(&handle);
    let gate = engine.gate(&handle);
    let scan = engine.scan_outcome(&handle);
    let events: Vec<ExecutionEvent> = engine
        .execute(&handle, true)
        .map_err(crate::exit::engine_err)?
        .collect();

    if json {
        return write_json(&PlanOutput {
            session_id: handle.id(),
            target: handle.target(),
            findings: &scan.findings,
            scheduled: &plan.tiers,
            fallback: &fallback,
            confirmation: gate.required,
            previews: &events,
        });
    }
    if !ui_cfg.quiet {
        let report = scan.report(handle.target(), &engine.capture_environment(), now_rfc3339());
        crate::ui::print_scan(&report, ui_cfg);
        println!();
        if !gate.assessments.is_empty() {
            println!("{}", gate.summary());
        }
    }
    crate::ui::print_preview(&events, ui_cfg);
    Ok(())
}

fn repair(
    cfg: &EffectiveConfig,
    home_dir: &Path,
    target: TargetVolume,
    ui_cfg: &UiConfig,
    json: bool,
) -> Result<()> {
    let log = Arc::new(JsonLinesLog::create(home_dir)?);
    let engine = build_engine(cfg, Arc::clone(&log) as Arc<dyn Logger>);
    let handle = engine
        .start_session(target, SessionMode::Apply)
        .map_err(crate::exit::engine_err)?;

    if !json && !ui_cfg.quiet {
        let scan = engine.scan_outcome(&handle);
        let report = scan.report(handle.target(), &engine.capture_environment(), now_rfc3339());
        crate::ui::print_scan(&report, ui_cfg);
        println!();
    }

    let progress_enabled = ui_cfg.stderr_is_tty && !ui_cfg.quiet;
    let mut spinner: Option<indicatif::ProgressBar> = None;
    for event in engine
        .execute(&handle, true)
        .map_err(crate::exit::engine_err)?
    {
        match &event {
            ExecutionEvent::Transition {
                to: SessionState::ExecutingTier(tier),
                ..
            } if progress_enabled => {
                let pb = spinner.get_or_insert_with(new_spinner);
                pb.set_message(format!("running {tier}"));
            }
            ExecutionEvent::Transition {
                to: SessionState::Verifying(Some(tier)),
                ..
            } => {
                if let Some(pb) = &spinner {
                    pb.set_message(format!("verifying {tier}"));
                }
            }
            _ => {}
        }
        match &spinner {
            Some(pb) => pb.suspend(|| crate::ui::print_event(&event, ui_cfg)),
            None => crate::ui::print_event(&event, ui_cfg),
        }
    }
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let report = engine.report(&handle);
    let report_path = match crate::logs::write_session_report(home_dir, &report) {
        Ok(path) => Some(path),
        Err(err) => {
            if !ui_cfg.quiet {
                eprintln!("warning: {err:#}");
            }
            None
        }
    };
    if let Some(err) = log.last_error() {
        if !ui_cfg.quiet {
            eprintln!("warning: session log is incomplete: {err}");
        }
    }

    if json {
        write_json(&report)?;
    } else {
        crate::ui::print_report(&report, ui_cfg);
    }
    if ui_cfg.verbose {
        eprintln!("log: {}", log.path().display());
        if let Some(path) = &report_path {
            eprintln!("report: {}", path.display());
        }
    }

    match report.state {
        SessionState::Succeeded | SessionState::Aborted => Ok(()),
        state => Err(crate::exit::repair_failed(match &report_path {
            Some(path) => format!("repair ended {state}; report: {}", path.display()),
            None => format!("repair ended {state}"),
        })),
    }
}

fn new_spinner() -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    use std::io::Write;

    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (expected bash|zsh|fish)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn repair_flags_parse() {
        let cli = Cli::try_parse_from([
            "bootmend", "repair", "--target", "c", "--apply", "--max-tier", "3", "--json",
        ])
        .expect("parse");
        let Commands::Repair(args) = cli.command else {
            panic!("expected repair");
        };
        assert!(args.apply);
        assert_eq!(args.max_tier, Some(3));
        assert!(cli.json);
    }

    #[test]
    fn target_must_be_a_drive_letter() {
        assert_eq!(parse_target("c:\\").unwrap().drive, "C:");
        let err = parse_target("C:\\Windows").unwrap_err();
        assert_eq!(crate::exit::exit_code(&err), 2);
    }

    #[test]
    fn unsupported_shell_is_invalid_args() {
        let err = parse_shell("powershell-ise").unwrap_err();
        assert_eq!(crate::exit::exit_code(&err), 2);
    }
}
