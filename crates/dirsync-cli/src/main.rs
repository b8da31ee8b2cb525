//! dirsync - mirror a local directory to remote storage
//!
//! Copies the remote prefix into the local directory once, then uploads
//! local changes until interrupted (SIGINT/SIGTERM). On shutdown every
//! pending change is flushed and uploaded before the process exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dirsync_core::config::{Config, ConfigBuilder};
use dirsync_sync::snapshot::SyncedSnapshot;
use dirsync_sync::{InitialSync, NotifyWatcher, SessionConfig, SyncSession};

mod output;

use output::{get_reporter, Reporter};

#[derive(Debug, Parser)]
#[command(
    name = "dirsync",
    version,
    about = "Mirror a local directory to remote storage"
)]
pub struct Cli {
    /// Remote directory URI (s3://bucket/dir, file:///srv/dir, or a path)
    #[arg(long)]
    remote: Option<String>,

    /// Local directory to mirror
    #[arg(long)]
    local: Option<PathBuf>,

    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quiet period in milliseconds before a changed file is uploaded
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Number of concurrent upload workers
    #[arg(long)]
    workers: Option<usize>,

    /// Retries after the first failed upload of a file
    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds between full local rescans (0 disables)
    #[arg(long)]
    rescan_secs: Option<u64>,

    /// Seconds to wait for uploads when stopping (0 waits indefinitely)
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Only copy remote to local, then exit
    #[arg(long)]
    once: bool,

    /// Report results as JSON lines
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Loads the config file and applies command-line overrides
    fn load_config(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load_or_default(&Config::default_path()),
        };

        let mut builder = ConfigBuilder::from_config(base);
        if let Some(remote) = &self.remote {
            builder = builder.remote_dir(remote.clone());
        }
        if let Some(local) = &self.local {
            builder = builder.local_dir(local.clone());
        }
        if let Some(ms) = self.debounce_ms {
            builder = builder.debounce_ms(ms);
        }
        if let Some(workers) = self.workers {
            builder = builder.worker_pool_size(workers);
        }
        if let Some(retries) = self.max_retries {
            builder = builder.max_retries(retries);
        }
        if let Some(secs) = self.rescan_secs {
            builder = builder.rescan_interval_secs(secs);
        }
        if let Some(secs) = self.drain_timeout_secs {
            builder = builder.drain_timeout_secs(secs);
        }
        if self.json_logs {
            builder = builder.logging_json(true);
        }

        builder.build_validated().map_err(|errors| {
            let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
            anyhow::anyhow!("invalid configuration: {}", details.join("; "))
        })
    }

    /// Log filter: `RUST_LOG` wins, then `-v`, then the configured level
    fn log_filter(&self, configured: &str) -> EnvFilter {
        let level = match self.verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }
}

fn init_tracing(filter: EnvFilter, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for SIGINT or SIGTERM, then cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

/// Copies remote to local and exits
async fn run_once(config: SessionConfig, reporter: &dyn Reporter) -> Result<ExitCode> {
    let store = dirsync_store::open(&config.remote_dir)?;
    let report = InitialSync::new(
        store,
        config.local_dir.clone(),
        config.remote_dir.clone(),
        Arc::new(SyncedSnapshot::new()),
    )
    .with_concurrency(config.initial_sync_concurrency)
    .with_retry(config.initial_sync_retry)
    .run()
    .await?;

    reporter.initial_sync(&report);
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: &Cli, config: Config, reporter: &dyn Reporter) -> Result<ExitCode> {
    let session_config = SessionConfig::from_config(&config)?;
    if cli.once {
        return run_once(session_config, reporter).await;
    }

    let store = dirsync_store::open(&session_config.remote_dir)?;
    let remote = session_config.remote_dir.to_string();
    let local = session_config.local_dir.clone();
    let session = SyncSession::new(session_config, store, Arc::new(NotifyWatcher::new()));
    let mut failures = session
        .take_failures()
        .context("failure channel already taken")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    tokio::select! {
        started = session.start() => started?,
        _ = shutdown.cancelled() => {
            warn!("Interrupted during initial sync");
            return Ok(ExitCode::FAILURE);
        }
    }
    reporter.started(session.id(), &remote, &local);

    let outcome = loop {
        tokio::select! {
            Some(failure) = failures.recv() => reporter.failure(&failure),
            _ = shutdown.cancelled() => {
                info!("Stopping: flushing pending changes");
                session.stop().await;
                break session.wait().await;
            }
            ended = session.wait() => break ended,
        }
    };

    while let Ok(failure) = failures.try_recv() {
        reporter.failure(&failure);
    }
    reporter.summary(session.state(), &session.stats());

    match outcome {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(error = %err, "Session ended with a fatal error");
            reporter.error(&err.to_string());
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("dirsync: {err:#}");
            return ExitCode::from(2);
        }
    };

    init_tracing(cli.log_filter(&config.logging.level), config.logging.json);
    info!(version = env!("CARGO_PKG_VERSION"), "dirsync starting");

    let reporter = get_reporter(cli.json);
    match run(&cli, config, reporter.as_ref()).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "dirsync exiting with error");
            reporter.error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["dirsync", "--config", "/nonexistent/dirsync.yaml"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "sync:\n  remote_dir: s3://bucket/from-file\n  local_dir: /data/file\n  debounce_ms: 500\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "dirsync",
            "--config",
            path.to_str().unwrap(),
            "--remote",
            "s3://bucket/from-flag",
            "--workers",
            "8",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();

        assert_eq!(config.sync.remote_dir, "s3://bucket/from-flag");
        assert_eq!(config.sync.local_dir, PathBuf::from("/data/file"));
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.sync.worker_pool_size, 8);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = parse(&["--remote", "s3://b/p", "--local", "/tmp/x"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_invalid_flags_fail_validation() {
        let cli = Cli::try_parse_from(["dirsync", "--remote", "s3://b/p", "--local", "/tmp/x", "--workers", "0"])
            .unwrap();
        let err = cli.load_config().unwrap_err();
        assert!(err.to_string().contains("worker_pool_size"));
    }

    #[test]
    fn test_verbose_and_once_flags() {
        let cli = parse(&["-vv", "--once", "--json"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.once);
        assert!(cli.json);
    }
}
