//! Quill CLI - drives a language server from the command line.
//!
//! ```text
//! main() -> init_tracing() -> QuillConfig::load() -> LspManager::start()
//!                                                        |
//!                                                        v
//!                                        commands::check | commands::complete
//! ```
//!
//! Logs go to `~/.quill/logs/quill.log` so command output stays clean;
//! `--log-stderr` sends them to stderr instead.

mod commands;

use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use quill_config::QuillConfig;

#[derive(Debug, Parser)]
#[command(name = "quill")]
#[command(version, about = "Language server client", long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.quill/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Language server executable, overriding the config
    #[arg(long, global = true)]
    server: Option<String>,

    /// Write logs to stderr instead of the log file
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open files and print the diagnostics the server reports
    Check {
        /// Source files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// How long to wait for diagnostics, in milliseconds
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },

    /// Print completion candidates at a position
    Complete {
        file: PathBuf,

        /// 1-based line
        line: u32,

        /// 1-based column
        column: u32,
    },
}

fn init_tracing(log_stderr: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if log_stderr {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
            .with(env_filter)
            .init();
        return;
    }

    let (log_file, init_warnings) = open_quill_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: keep command output clean rather than log to the terminal.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_quill_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in quill_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn quill_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.quill/logs/quill.log
    if let Some(config_path) = QuillConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("quill.log"));
    }

    // Fallback: ./.quill/logs/quill.log
    candidates.push(PathBuf::from(".quill").join("logs").join("quill.log"));

    candidates
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = QuillConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let mut lsp = config.lsp();
    if let Some(server) = cli.server {
        lsp.command = server;
    }
    let root = std::env::current_dir().context("reading current directory")?;

    match cli.command {
        Command::Check { files, wait_ms } => commands::check(lsp, &root, &files, wait_ms).await,
        Command::Complete { file, line, column } => {
            commands::complete(lsp, &root, &file, line, column).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_stderr);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("quill: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_with_globals() {
        let cli = Cli::try_parse_from([
            "quill",
            "--server",
            "ccls",
            "check",
            "a.c",
            "b.c",
            "--wait-ms",
            "500",
            "--log-stderr",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("ccls"));
        assert!(cli.log_stderr);
        match cli.command {
            Command::Check { files, wait_ms } => {
                assert_eq!(files, [PathBuf::from("a.c"), PathBuf::from("b.c")]);
                assert_eq!(wait_ms, 500);
            }
            Command::Complete { .. } => panic!("expected check"),
        }
    }

    #[test]
    fn check_requires_a_file() {
        assert!(Cli::try_parse_from(["quill", "check"]).is_err());
    }

    #[test]
    fn parses_complete() {
        let cli = Cli::try_parse_from(["quill", "complete", "main.c", "3", "7"]).unwrap();
        match cli.command {
            Command::Complete { file, line, column } => {
                assert_eq!(file, PathBuf::from("main.c"));
                assert_eq!((line, column), (3, 7));
            }
            Command::Check { .. } => panic!("expected complete"),
        }
    }

    #[test]
    fn log_candidates_end_with_local_fallback() {
        let candidates = quill_log_file_candidates();
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".quill").join("logs").join("quill.log"))
        );
    }
}
