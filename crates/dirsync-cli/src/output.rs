//! Human and JSON reporting of session events
//!
//! Logs go to stderr through `tracing`; this module writes the user-facing
//! lines (stdout for results, stderr for problems).

use std::path::Path;

use dirsync_core::domain::{SessionId, SessionState, SessionStats};
use dirsync_sync::{InitialSyncReport, SyncFailure};

/// Sink for the events the binary reports to the user
pub trait Reporter {
    fn started(&self, id: SessionId, remote: &str, local: &Path);
    fn initial_sync(&self, report: &InitialSyncReport);
    fn failure(&self, failure: &SyncFailure);
    fn summary(&self, state: SessionState, stats: &SessionStats);
    fn error(&self, message: &str);
}

/// Plain-text reporter
pub struct HumanReporter;

impl Reporter for HumanReporter {
    fn started(&self, id: SessionId, remote: &str, local: &Path) {
        println!("\u{2713} Syncing {} \u{2192} {} (session {id})", local.display(), remote);
    }

    fn initial_sync(&self, report: &InitialSyncReport) {
        println!(
            "\u{2713} Copied {} of {} objects ({} bytes)",
            report.files_downloaded, report.objects_listed, report.bytes_downloaded
        );
    }

    fn failure(&self, failure: &SyncFailure) {
        eprintln!("\u{26a0} Not synced: {}: {}", failure.path, failure.error);
    }

    fn summary(&self, state: SessionState, stats: &SessionStats) {
        println!("Session {state}");
        println!("  downloaded: {}", stats.files_downloaded);
        println!("  uploaded:   {}", stats.files_uploaded);
        println!("  deleted:    {}", stats.files_deleted);
        println!("  retries:    {}", stats.retries);
        println!("  failures:   {}", stats.failures);
    }

    fn error(&self, message: &str) {
        eprintln!("\u{2717} Error: {message}");
    }
}

/// Newline-delimited JSON reporter
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn started(&self, id: SessionId, remote: &str, local: &Path) {
        println!(
            "{}",
            serde_json::json!({
                "event": "started",
                "session_id": id.to_string(),
                "remote": remote,
                "local": local.display().to_string(),
            })
        );
    }

    fn initial_sync(&self, report: &InitialSyncReport) {
        println!(
            "{}",
            serde_json::json!({
                "event": "initial_sync",
                "objects_listed": report.objects_listed,
                "files_downloaded": report.files_downloaded,
                "bytes_downloaded": report.bytes_downloaded,
            })
        );
    }

    fn failure(&self, failure: &SyncFailure) {
        eprintln!(
            "{}",
            serde_json::json!({
                "event": "sync_failure",
                "path": failure.path.as_str(),
                "error": failure.error.to_string(),
            })
        );
    }

    fn summary(&self, state: SessionState, stats: &SessionStats) {
        println!(
            "{}",
            serde_json::json!({
                "event": "summary",
                "state": state,
                "stats": stats,
            })
        );
    }

    fn error(&self, message: &str) {
        eprintln!("{}", serde_json::json!({"event": "error", "error": message}));
    }
}

pub fn get_reporter(json: bool) -> Box<dyn Reporter> {
    if json {
        Box::new(JsonReporter)
    } else {
        Box::new(HumanReporter)
    }
}
