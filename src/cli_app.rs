//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use mailpulse::api::endpoint::{Endpoint, RequestParams, dispatch};
use mailpulse::api::monitor::{HealthReport, Monitor};
use mailpulse::core::config::Config;
use mailpulse::core::errors::MpError;
use mailpulse::logger::activity::ActivityLoggerHandle;
use mailpulse::logs::classifier::Category;
use mailpulse::source::resolver::{SourceDescriptor, SourceMode};
use mailpulse::stats::aggregate::{SeriesReport, TodayStats};
use mailpulse::stats::talkers::{RankedCounts, TalkerSpan, TalkerTable};
use mailpulse::stats::window::WindowKind;

/// Mail-server health probe over MTA logs and system commands.
#[derive(Debug, Parser)]
#[command(
    name = "mailpulse",
    author,
    version,
    about = "Mail server health from logs, queue and sessions",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase verbosity.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Serve the JSON API over HTTP.
    #[cfg(feature = "server")]
    Serve(ServeArgs),
    /// Answer one API endpoint and print its JSON.
    Api(ApiArgs),
    /// Show the selected log source.
    Source(SourceArgs),
    /// Today's per-category totals and success rate.
    Today,
    /// Bucketed series for a time window.
    Series(SeriesArgs),
    /// Top senders and recipients.
    Top(TopArgs),
    /// Source, strategy and warning diagnostics.
    Health,
    /// View and validate configuration.
    Config(ConfigArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[cfg(feature = "server")]
#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Listen address, overriding `server.bind`.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ApiArgs {
    /// Endpoint name, e.g. `series_live` or `top_week`.
    name: String,
    /// Re-scan the log source instead of using the cached decision.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct SourceArgs {
    /// Re-scan the log source instead of using the cached decision.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Args)]
struct SeriesArgs {
    /// live, today, week or month.
    #[arg(default_value = "live")]
    window: String,
}

#[derive(Debug, Clone, Args)]
struct TopArgs {
    /// day, week or month.
    #[arg(default_value = "day")]
    span: String,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include build metadata.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        #[cfg(feature = "server")]
        Command::Serve(args) => run_serve(cli, args),
        Command::Api(args) => run_api(cli, args),
        Command::Source(args) => run_source(cli, args),
        Command::Today => run_today(cli),
        Command::Series(args) => run_series(cli, args),
        Command::Top(args) => run_top(cli, args),
        Command::Health => run_health(cli),
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    let config = Config::load(cli.config.as_deref()).map_err(|e| match e {
        MpError::MissingConfig { .. }
        | MpError::InvalidConfig { .. }
        | MpError::ConfigParse { .. }
        | MpError::Pattern { .. } => CliError::User(e.to_string()),
        other => CliError::Runtime(other.to_string()),
    })?;
    if cli.verbose {
        eprintln!("config: {}", config.paths.config_file.display());
    }
    Ok(config)
}

/// One-shot commands run without an activity log.
fn build_monitor(cli: &Cli) -> Result<Monitor, CliError> {
    let config = load_config(cli)?;
    Monitor::from_config(config, ActivityLoggerHandle::disabled())
        .map_err(|e| CliError::Internal(e.to_string()))
}

#[cfg(feature = "server")]
fn run_serve(cli: &Cli, args: &ServeArgs) -> Result<(), CliError> {
    use std::net::SocketAddr;

    use mailpulse::api::server::{AppState, serve};
    use mailpulse::logger::activity::spawn_logger;
    use mailpulse::logger::jsonl::JsonlConfig;

    let config = load_config(cli)?;
    let raw_bind = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let bind: SocketAddr = raw_bind
        .parse()
        .map_err(|e| CliError::User(format!("invalid bind address {raw_bind:?}: {e}")))?;

    let (logger, logger_thread) = spawn_logger(JsonlConfig::for_path(config.paths.activity_log.clone()))
        .map_err(|e| CliError::Runtime(e.to_string()))?;
    let monitor = Monitor::from_config(config, logger.clone())
        .map_err(|e| CliError::Internal(e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Runtime(format!("tokio runtime: {e}")))?;
    let served = runtime.block_on(serve(
        AppState {
            monitor,
            logger: logger.clone(),
        },
        bind,
    ));

    logger.shutdown();
    let _ = logger_thread.join();
    served.map_err(|e| CliError::Runtime(e.to_string()))
}

fn run_api(cli: &Cli, args: &ApiArgs) -> Result<(), CliError> {
    let monitor = build_monitor(cli)?;
    let response = dispatch(
        &monitor,
        &args.name,
        RequestParams { force: args.force },
        &ActivityLoggerHandle::disabled(),
    );
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&response.body)?,
        OutputMode::Human => println!("{}", serde_json::to_string_pretty(&response.body)?),
    }
    match response.status {
        200 => Ok(()),
        404 => {
            let known: Vec<&str> = Endpoint::ALL.iter().map(|e| e.as_str()).collect();
            Err(CliError::User(format!(
                "unknown endpoint {:?}; known: {}",
                args.name,
                known.join(", ")
            )))
        }
        _ => Err(CliError::Runtime(format!("endpoint {} failed", args.name))),
    }
}

fn run_source(cli: &Cli, args: &SourceArgs) -> Result<(), CliError> {
    let descriptor = build_monitor(cli)?.source(args.force);
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&descriptor)?)?,
        OutputMode::Human => print_source_human(&descriptor, cli.quiet),
    }
    Ok(())
}

fn run_today(cli: &Cli) -> Result<(), CliError> {
    let stats = build_monitor(cli)?.today();
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&stats)?)?,
        OutputMode::Human => print_today_human(&stats),
    }
    Ok(())
}

fn run_series(cli: &Cli, args: &SeriesArgs) -> Result<(), CliError> {
    let kind: WindowKind = args
        .window
        .parse()
        .map_err(|e: MpError| CliError::User(e.to_string()))?;
    let report = build_monitor(cli)?.series(kind);
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&report)?)?,
        OutputMode::Human => print_series_human(&report),
    }
    Ok(())
}

fn run_top(cli: &Cli, args: &TopArgs) -> Result<(), CliError> {
    let span: TalkerSpan = args
        .span
        .parse()
        .map_err(|e: MpError| CliError::User(e.to_string()))?;
    let table = build_monitor(cli)?.top_talkers(span);
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&table)?)?,
        OutputMode::Human => print_top_human(&table, span),
    }
    Ok(())
}

fn run_health(cli: &Cli) -> Result<(), CliError> {
    let report = build_monitor(cli)?.health();
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&report)?)?,
        OutputMode::Human => print_health_human(&report, cli.verbose),
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists && !cli.quiet {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("{}", "Configuration is valid.".green());
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("{} {e}", "Configuration is INVALID:".red());
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                            "code": e.code(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");
    let server = cfg!(feature = "server");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("mailpulse {version}");
            if args.verbose || cli.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
                println!("server: {server}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "mailpulse",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                    "server": server,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Human rendering
// ---------------------------------------------------------------------------

fn print_source_human(descriptor: &SourceDescriptor, quiet: bool) {
    match &descriptor.mode {
        Some(SourceMode::FileGlob { pattern, files }) => {
            println!("{} {} ({} file(s))", "Source:".bold(), pattern, files.len());
            for file in files {
                println!("  {}", file.display());
            }
        }
        Some(SourceMode::Journal) => println!("{} journal", "Source:".bold()),
        None => println!("{} {}", "Source:".bold(), "none found".red()),
    }
    if quiet {
        return;
    }
    println!("  Decided at: {}", descriptor.decided_at);
    println!("  Server TZ: {}", descriptor.server_tz);
    for entry in &descriptor.scan_report {
        println!("  scanned {:<32} {:>4}", entry.pattern, entry.files_found);
    }
    let missing: Vec<&str> = descriptor
        .binaries
        .iter()
        .filter(|(_, present)| !**present)
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing.is_empty() {
        println!("  {} {}", "Missing binaries:".yellow(), missing.join(", "));
    }
}

fn print_today_human(stats: &TodayStats) {
    println!("{} {}", "Today".bold(), stats.date);
    for category in [
        Category::Incoming,
        Category::Sent,
        Category::FailedDelivery,
        Category::Rejected,
        Category::Greylisted,
        Category::RblReject,
        Category::SpamVirus,
        Category::QuotaFail,
        Category::AuthFail,
    ] {
        println!("  {:<16} {:>8}", category.as_str(), stats.count(category));
    }
    let rate = format!("{:.1}%", stats.success_rate);
    let rate = match success_band(stats.success_rate) {
        Band::Good => rate.green(),
        Band::Fair => rate.yellow(),
        Band::Poor => rate.red(),
    };
    println!("  {:<16} {:>8}", "success_rate", rate);
}

fn print_series_human(report: &SeriesReport) {
    print!("{:<8}", report.kind.as_str().bold());
    for (category, _) in &report.series {
        print!(" {:>15}", category.as_str());
    }
    println!();
    for (i, label) in report.labels.iter().enumerate() {
        print!("{label:<8}");
        for (_, counts) in &report.series {
            print!(" {:>15}", counts.get(i).copied().unwrap_or(0));
        }
        println!();
    }
}

fn print_top_human(table: &TalkerTable, span: TalkerSpan) {
    print_ranked(&format!("Top senders ({span})"), &table.senders);
    print_ranked(&format!("Top recipients ({span})"), &table.recipients);
}

fn print_ranked(title: &str, counts: &RankedCounts) {
    println!("{}", title.bold());
    if counts.is_empty() {
        println!("  (none)");
    }
    for (address, count) in counts.iter() {
        println!("  {count:>7}  {address}");
    }
}

fn print_health_human(report: &HealthReport, verbose: bool) {
    let source = match &report.source {
        Some(SourceMode::FileGlob { pattern, .. }) => pattern.clone(),
        Some(SourceMode::Journal) => "journal".to_string(),
        None => "none".to_string(),
    };
    println!("{} {}", "Source:".bold(), source);
    println!("  Strategy: {} ({})", report.strategy, report.note);
    if let Some(plain) = &report.active_plain {
        println!("  Active file: {}", plain.display());
    }
    println!("  Rows in last 60s: {}", report.recent_60s_rows);
    println!("  Escalation: {}", if report.escalation { "on" } else { "off" });
    println!("  Server TZ: {}", report.server_tz);
    if verbose {
        for (name, present) in &report.binaries {
            let mark = if *present { "ok".green() } else { "missing".red() };
            println!("  {name:<12} {mark}");
        }
    }
    if report.warnings.is_empty() {
        println!("  {}", "No warnings".green());
    } else {
        for warning in &report.warnings {
            println!("  {} {warning}", "warning:".yellow());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Good,
    Fair,
    Poor,
}

fn success_band(rate: f64) -> Band {
    if rate >= 90.0 {
        Band::Good
    } else if rate >= 70.0 {
        Band::Fair
    } else {
        Band::Poor
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("MAILPULSE_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
