use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

use trail_core::config::Destination;

/// Record terminal sessions to tamper-evident logs, roll them up, and ship them.
#[derive(Debug, Parser)]
#[command(name = "trail", version, about)]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/trail/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session log root, overriding `logging.root`.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a program under the interceptor and record the session.
    Run {
        /// Link the new session to an earlier one.
        #[arg(long, value_name = "SESSION_ID")]
        resume: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Check the hash chain of sessions.
    Verify {
        /// Session ids, session directories or events.jsonl files. All sessions when empty.
        targets: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// Aggregate sessions into a usage report.
    Rollup {
        /// Single day to report on (default: yesterday, UTC).
        date: Option<NaiveDate>,

        /// Last N days ending today.
        #[arg(long, conflicts_with_all = ["date", "start"])]
        days: Option<u32>,

        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,

        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,

        #[arg(long, value_enum, default_value_t = GranularityArg::Daily)]
        granularity: GranularityArg,

        #[arg(long, value_enum, default_value_t = ReportFormat::Markdown)]
        format: ReportFormat,

        /// Write the report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ship new records continuously.
    Follow {
        /// One pass, then exit.
        #[arg(long)]
        once: bool,

        #[arg(long)]
        destination: Option<Destination>,
    },

    /// Ship one events.jsonl file.
    Ship {
        path: PathBuf,

        #[arg(long)]
        destination: Option<Destination>,
    },

    /// Serve the ingest endpoint.
    Gateway {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },

    /// Delete sessions older than the retention window.
    Prune {
        /// Retention in days; negative keeps everything.
        #[arg(long, allow_negative_numbers = true)]
        days: Option<i64>,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GranularityArg {
    Daily,
    Weekly,
}

impl From<GranularityArg> for trail_rollup::Granularity {
    fn from(arg: GranularityArg) -> Self {
        match arg {
            GranularityArg::Daily => Self::Daily,
            GranularityArg::Weekly => Self::Weekly,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Markdown,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_keeps_child_flags() {
        let cli = Cli::parse_from(["trail", "run", "codex", "-m", "gpt-5", "--full-auto"]);
        match cli.command {
            Command::Run { command, resume } => {
                assert_eq!(command, vec!["codex", "-m", "gpt-5", "--full-auto"]);
                assert!(resume.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rollup_parses_range() {
        let cli = Cli::parse_from(["trail", "rollup", "--start", "2024-05-01", "--end", "2024-05-07", "--granularity", "weekly"]);
        match cli.command {
            Command::Rollup { start, end, granularity, .. } => {
                assert_eq!(start, NaiveDate::from_ymd_opt(2024, 5, 1));
                assert_eq!(end, NaiveDate::from_ymd_opt(2024, 5, 7));
                assert_eq!(granularity, GranularityArg::Weekly);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn destination_is_parsed() {
        let cli = Cli::parse_from(["trail", "follow", "--once", "--destination", "loki"]);
        assert!(matches!(
            cli.command,
            Command::Follow { once: true, destination: Some(Destination::Loki) }
        ));
    }
}
