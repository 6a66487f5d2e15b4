mod cli;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use trail_core::config::{apply_env_overrides, config_path, load_config_from_path, Destination};
use trail_core::{SessionId, TrailConfig};
use trail_pty::{hostname, InterceptOptions, Interceptor, TerminalIo};
use trail_rollup::{RollupEngine, RollupRange};
use trail_ship::{sink_from_config, FollowOptions, Follower, RetryPolicy, Sink};
use trail_store::{discover_all, prune, verify_file, CursorRepo, Database, FileVerification, SessionMetadata, SessionPaths};
use trail_telemetry::{init_telemetry, LogTarget, TelemetryConfig};

use crate::cli::{Cli, Command, ReportFormat};

/// Exit status of `verify` when any chain is broken.
const EXIT_BROKEN: i32 = 2;
/// Exit status of `ship` when a batch ended up held.
const EXIT_HELD: i32 = 3;

fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("trail: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let Cli {
        config: config_arg,
        root: root_arg,
        command,
    } = cli;
    let config_file = config_arg.clone().unwrap_or_else(config_path);

    if let Command::Run { resume, command } = command {
        // A broken config must not keep the wrapped program from starting.
        let (config, config_error) = load_config_or_default(&config_file);
        let launch = Launch {
            root: root_arg.unwrap_or_else(|| config.logging.root_dir()),
            config_file: config_arg,
            config_error,
        };
        return run_session(&config, launch, resume, command);
    }

    let config = load_config_from_path(&config_file).with_context(|| format!("loading {}", config_file.display()))?;
    let root = root_arg.unwrap_or_else(|| config.logging.root_dir());
    let _telemetry = init_telemetry(TelemetryConfig::from_names(
        &config.telemetry.level,
        &config.telemetry.format,
    ))
    .context("initializing telemetry")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(run_command(command, config, root))
}

/// Config for `trail run`, or defaults plus the reason the file was unusable.
fn load_config_or_default(path: &Path) -> (TrailConfig, Option<String>) {
    match load_config_from_path(path) {
        Ok(config) => (config, None),
        Err(e) => {
            let mut config = TrailConfig::default();
            apply_env_overrides(&mut config);
            (config, Some(format!("ignoring config {}: {e:#}", path.display())))
        }
    }
}

struct Launch {
    /// Explicit `--config`, handed on to the post-session shipper.
    config_file: Option<PathBuf>,
    config_error: Option<String>,
    root: PathBuf,
}

/// `trail [--config F] --root R ship` as a command prefix.
fn ship_command(launch: &Launch) -> Option<Vec<String>> {
    let exe = std::env::current_exe().ok()?;
    let mut command = vec![exe.display().to_string()];
    if let Some(path) = &launch.config_file {
        command.extend(["--config".to_string(), path.display().to_string()]);
    }
    command.extend([
        "--root".to_string(),
        launch.root.display().to_string(),
        "ship".to_string(),
    ]);
    Some(command)
}

/// Wrap a program. Never returns normally on success: the wrapper exits the
/// way the child did.
fn run_session(config: &TrailConfig, launch: Launch, resume: Option<String>, command: Vec<String>) -> Result<i32> {
    if let Some(reason) = &launch.config_error {
        eprintln!("trail: {reason}");
    }
    let resume_from = resume.map(SessionId::from_raw);
    if let Some(id) = &resume_from {
        if !id.is_well_formed() {
            bail!("not a session id: {id}");
        }
    }

    // Diagnostics must never reach the wrapped terminal.
    let diagnostics = launch.root.join("diagnostics").join("trail-run.log");
    let _telemetry = init_telemetry(
        TelemetryConfig::from_names(&config.telemetry.level, &config.telemetry.format)
            .with_target(LogTarget::File(diagnostics)),
    )
    .ok();
    if let Some(reason) = &launch.config_error {
        tracing::warn!(%reason, "running with default config");
    }

    let ship_after = if config.interceptor.ship_on_exit {
        ship_command(&launch)
    } else {
        None
    };
    let options = InterceptOptions {
        command,
        root: launch.root,
        resume_from,
        config: config.interceptor.clone(),
        ship_after,
    };
    match Interceptor::new(options).run(TerminalIo::stdio()) {
        Ok(outcome) => {
            if std::io::stderr().is_terminal() && outcome.logged {
                let hash = outcome.final_hash.as_deref().map_or("-", |h| &h[..h.len().min(12)]);
                eprintln!(
                    "trail: session {} ({} records, {} bytes in, {} bytes out, final {hash})",
                    outcome.session_id, outcome.counters.records, outcome.bytes_in, outcome.bytes_out
                );
                eprintln!("trail: log {}", outcome.paths.events.display());
            }
            outcome.exit.propagate()
        }
        Err(e) => {
            eprintln!("trail: {e}");
            Ok(e.exit_code())
        }
    }
}

async fn run_command(command: Command, config: TrailConfig, root: PathBuf) -> Result<i32> {
    match command {
        Command::Run { .. } => bail!("run must not start inside the async runtime"),
        Command::Verify { targets, json } => verify(&root, &targets, json),
        Command::Rollup {
            date,
            days,
            start,
            end,
            granularity,
            format,
            output,
        } => {
            let today = Utc::now().date_naive();
            let range = match (start, end, days) {
                (Some(start), Some(end), _) => RollupRange::new(start, end)?,
                (_, _, Some(days)) => RollupRange::last_days(today, days.max(1)),
                _ => RollupRange::day(date.unwrap_or(today - Duration::days(1))),
            };
            let engine = RollupEngine::from_config(&root, &config.rollup);
            let report = engine.run(range, granularity.into())?;
            let text = match format {
                ReportFormat::Markdown => report.to_markdown(),
                ReportFormat::Json => report.to_json()?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("trail: report written to {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(0)
        }
        Command::Follow { once, destination } => {
            let mut follower = build_follower(&config, &root, destination)?;
            if once {
                let summary = follower.run_once().await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(0);
            }
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping follower");
                }
                trigger.cancel();
            });
            follower.run(cancel).await?;
            Ok(0)
        }
        Command::Ship { path, destination } => {
            let mut follower = build_follower(&config, &root, destination)?;
            let summary = follower.ship_file(&path).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.held.is_empty() { 0 } else { EXIT_HELD })
        }
        Command::Gateway { host, port } => {
            let mut options = trail_gateway::GatewayOptions::from_config(&config.gateway, root);
            if let Some(host) = host {
                options.host = host;
            }
            if let Some(port) = port {
                options.port = port;
            }
            let handle = trail_gateway::start(options).await?;
            tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
            tracing::info!("shutting down");
            handle.shutdown().await?;
            Ok(0)
        }
        Command::Prune { days, dry_run } => {
            let retention = days.unwrap_or(config.logging.retention_days);
            let report = prune(&root, retention, Utc::now().date_naive(), dry_run)?;
            let verb = if dry_run { "would remove" } else { "removed" };
            for dir in &report.removed {
                println!("{verb} {}", dir.display());
            }
            println!("{} kept, {} {verb}", report.kept, report.removed.len());
            Ok(0)
        }
    }
}

fn build_follower(config: &TrailConfig, root: &Path, destination: Option<Destination>) -> Result<Follower> {
    let mut follower_config = config.follower.clone();
    if let Some(destination) = destination {
        follower_config.destination = destination;
    }
    let sink: Arc<dyn Sink> = sink_from_config(&follower_config, &config.gateway, &config.loki, &hostname())?;
    let db_path = follower_config.state_db_path(root);
    let db = Database::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?;
    Ok(Follower::new(
        root.to_path_buf(),
        CursorRepo::new(db),
        sink,
        RetryPolicy::from_config(&follower_config),
        FollowOptions::from_config(&follower_config),
    ))
}

fn verify(root: &Path, targets: &[String], json: bool) -> Result<i32> {
    let sessions: Vec<SessionPaths> = if targets.is_empty() {
        discover_all(root)?.into_iter().map(|loc| loc.paths).collect()
    } else {
        targets.iter().map(|t| resolve_target(root, t)).collect::<Result<_>>()?
    };

    let mut results: Vec<FileVerification> = Vec::new();
    for paths in &sessions {
        let expected = SessionMetadata::read(&paths.meta)
            .ok()
            .flatten()
            .and_then(|meta| meta.final_hash);
        results.push(verify_file(&paths.events, expected.as_deref())?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for result in &results {
            let tail = if result.truncated_tail { " (truncated tail)" } else { "" };
            let verdict = if result.is_intact() { "ok" } else { "FAILED" };
            println!(
                "{verdict:<6} {} {} records, {}{tail}",
                result.path.display(),
                result.report.valid_records,
                result.report.status
            );
        }
    }
    let broken = results.iter().filter(|r| !r.is_intact()).count();
    Ok(if broken == 0 { 0 } else { EXIT_BROKEN })
}

/// A session id, a session directory, or an events file.
fn resolve_target(root: &Path, target: &str) -> Result<SessionPaths> {
    let path = Path::new(target);
    if path.is_dir() {
        return Ok(SessionPaths::from_dir(path.to_path_buf()));
    }
    if path.is_file() {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut paths = SessionPaths::from_dir(dir);
        paths.events = path.to_path_buf();
        return Ok(paths);
    }
    discover_all(root)?
        .into_iter()
        .find(|loc| loc.session_id.as_str() == target)
        .map(|loc| loc.paths)
        .with_context(|| format!("no session {target} under {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_config_falls_back_to_defaults_for_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[interceptor\nforward_signals = ").unwrap();

        let (config, error) = load_config_or_default(&path);
        let error = error.unwrap();
        assert!(error.contains("config.toml"), "{error}");
        assert_eq!(config.interceptor.transient_retry_limit, 3);
        assert!(config.interceptor.forward_signals);
    }

    #[test]
    fn readable_config_is_used_for_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[interceptor]\nforward_signals = false\n").unwrap();

        let (config, error) = load_config_or_default(&path);
        assert!(error.is_none());
        assert!(!config.interceptor.forward_signals);
    }

    #[test]
    fn ship_command_carries_config_and_root() {
        let launch = Launch {
            config_file: Some(PathBuf::from("/etc/trail.toml")),
            config_error: None,
            root: PathBuf::from("/var/log/trail"),
        };
        let command = ship_command(&launch).unwrap();
        assert_eq!(
            &command[1..],
            ["--config", "/etc/trail.toml", "--root", "/var/log/trail", "ship"]
        );
    }
}
