//! sync command - Synchronize a local directory to a bucket prefix
//!
//! Uploads new and changed files, optionally removing remote objects that no
//! longer exist locally.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use comfy_table::{Cell, Table};
use indicatif::{ProgressBar, ProgressStyle};
use objsync_core::{
    CancellationToken, Operation, OperationKind, RemotePath, SyncManager, SyncOptions, SyncReport,
    SyncState,
};
use serde::Serialize;

use super::{Session, fail, remote_path};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Synchronize a local directory to a bucket prefix
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Local directory
    pub source: PathBuf,

    /// Destination (alias/bucket[/prefix])
    pub target: String,

    /// Remove remote objects that do not exist locally
    #[arg(long)]
    pub delete: bool,

    /// Show the plan without changing anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Compare MD5 checksums when sizes and times match
    #[arg(long)]
    pub checksum: bool,

    /// Glob of relative paths to leave alone (repeatable)
    #[arg(long, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Files uploaded concurrently
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SyncOutput<'a> {
    source: String,
    target: String,
    #[serde(flatten)]
    report: &'a SyncReport,
}

/// Execute the sync command
pub async fn execute(args: SyncArgs, output_config: OutputConfig, cancel: CancellationToken) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let target = match remote_path(&args.target) {
        Ok(p) => p,
        Err(e) => {
            formatter.error(&e.to_string());
            return ExitCode::UsageError;
        }
    };

    let session = match Session::open(&target.alias, &cancel).await {
        Ok(s) => s,
        Err(e) => return fail(&formatter, &e),
    };

    let manager = SyncManager::new(session.client, session.config.transfer.clone());
    let options = sync_options(&args, &target);
    let progress = formatter.show_progress().then(|| Progress::start(&manager));

    let outcome = manager.sync(&cancel, options).await;

    if let Some(progress) = progress {
        progress.finish();
    }

    match outcome {
        Ok(report) => {
            render(&formatter, &args, &target, &report);
            if report.result.is_success() {
                ExitCode::Success
            } else {
                ExitCode::GeneralError
            }
        }
        Err(e) => {
            let error = anyhow::Error::new(e).context(format!(
                "Sync of {} to {target} failed",
                args.source.display()
            ));
            fail(&formatter, &error)
        }
    }
}

fn sync_options(args: &SyncArgs, target: &RemotePath) -> SyncOptions {
    SyncOptions::new(&args.source, &target.bucket, &target.key)
        .delete_extra(args.delete)
        .dry_run(args.dry_run)
        .checksum(args.checksum)
        .exclude(args.exclude.clone())
        .parallelism(args.parallel.unwrap_or(0))
        .timeout(args.timeout.map(Duration::from_secs))
}

/// Spinner that follows the manager's state
struct Progress {
    bar: ProgressBar,
    watcher: tokio::task::JoinHandle<()>,
}

impl Progress {
    fn start(manager: &SyncManager) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut states = manager.subscribe();
        let shown = bar.clone();
        let watcher = tokio::spawn(async move {
            loop {
                let state = *states.borrow_and_update();
                shown.set_message(describe(state));
                if state.is_terminal() || states.changed().await.is_err() {
                    break;
                }
            }
        });

        Self { bar, watcher }
    }

    fn finish(self) {
        self.watcher.abort();
        self.bar.finish_and_clear();
    }
}

fn describe(state: SyncState) -> &'static str {
    match state {
        SyncState::Idle => "Starting",
        SyncState::ScanningLocal => "Scanning local files",
        SyncState::ScanningRemote => "Listing remote objects",
        SyncState::Planning => "Comparing",
        SyncState::Executing => "Transferring",
        SyncState::DryRunDone | SyncState::Done => "Done",
        SyncState::Failed => "Failed",
    }
}

fn render(formatter: &Formatter, args: &SyncArgs, target: &RemotePath, report: &SyncReport) {
    if formatter.is_json() {
        formatter.json(&SyncOutput {
            source: args.source.display().to_string(),
            target: target.to_string(),
            report,
        });
        return;
    }

    let changes: Vec<&Operation> = report
        .operations
        .iter()
        .filter(|op| op.kind != OperationKind::Skip)
        .collect();

    if report.dry_run {
        if changes.is_empty() {
            formatter.println(&format!(
                "Everything up to date ({} unchanged)",
                report.count(OperationKind::Skip)
            ));
            return;
        }
        formatter.println("Dry run mode - no changes will be made:");
        formatter.println(&plan_table(formatter, &changes).to_string());
        formatter.println(&format!(
            "Summary: {} to upload, {} to delete, {} unchanged",
            report.count(OperationKind::Upload),
            report.count(OperationKind::Delete),
            report.count(OperationKind::Skip)
        ));
        return;
    }

    for error in &report.result.errors {
        formatter.error(&format!(
            "Failed to {} {}: {}",
            error.operation, error.key, error.message
        ));
    }
    formatter.println(&summary(formatter, report));
}

fn plan_table(formatter: &Formatter, operations: &[&Operation]) -> Table {
    let mut table = formatter.table();
    table.set_header(vec!["Action", "Key", "Size", "Reason"]);
    for op in operations {
        let size = match op.kind {
            OperationKind::Upload => humansize::format_size(op.size, humansize::BINARY),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(op.kind),
            Cell::new(&op.remote_key),
            Cell::new(size),
            Cell::new(&op.reason),
        ]);
    }
    table
}

fn summary(formatter: &Formatter, report: &SyncReport) -> String {
    let result = &report.result;
    format!(
        "Sync complete: {} uploaded ({}), {} deleted, {} unchanged, {} errors in {:.2}s",
        result.files_uploaded,
        formatter.size(result.bytes_uploaded),
        result.files_deleted,
        result.files_skipped,
        result.errors.len(),
        result.duration.as_secs_f64()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_core::{SyncResult, TransferConfig};
    use std::sync::Arc;

    fn args(target: &str) -> SyncArgs {
        SyncArgs {
            source: PathBuf::from("./site"),
            target: target.to_string(),
            delete: true,
            dry_run: true,
            checksum: false,
            exclude: vec!["*.tmp".to_string()],
            parallel: Some(8),
            timeout: Some(30),
        }
    }

    fn plain() -> Formatter {
        Formatter::new(OutputConfig {
            no_color: true,
            ..Default::default()
        })
    }

    fn upload(key: &str, size: u64) -> Operation {
        Operation {
            kind: OperationKind::Upload,
            local_path: Some(PathBuf::from(key)),
            remote_key: key.to_string(),
            size,
            reason: "new".to_string(),
        }
    }

    #[test]
    fn test_options_from_args() {
        let args = args("local/bucket/www");
        let target = remote_path(&args.target).unwrap();
        let options = sync_options(&args, &target);

        assert_eq!(options.bucket, "bucket");
        assert_eq!(options.prefix, "www");
        assert!(options.delete_extra);
        assert!(options.dry_run);
        assert_eq!(options.parallelism, 8);
        assert_eq!(options.exclude, vec!["*.tmp".to_string()]);
        assert_eq!(options.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_plan_table_lists_changes() {
        let ops = [upload("www/index.html", 2048)];
        let refs: Vec<&Operation> = ops.iter().collect();
        let rendered = plan_table(&plain(), &refs).to_string();

        assert!(rendered.contains("upload"));
        assert!(rendered.contains("www/index.html"));
        assert!(rendered.contains("2 KiB"));
    }

    #[test]
    fn test_summary_line() {
        let report = SyncReport {
            operations: vec![],
            result: SyncResult {
                files_uploaded: 2,
                files_skipped: 1,
                files_deleted: 1,
                bytes_uploaded: 1024,
                errors: vec![],
                duration: Duration::from_millis(1500),
            },
            dry_run: false,
        };
        assert_eq!(
            summary(&plain(), &report),
            "Sync complete: 2 uploaded (1 KiB), 1 deleted, 1 unchanged, 0 errors in 1.50s"
        );
    }

    #[tokio::test]
    async fn test_json_output_shape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>").unwrap();

        let store = Arc::new(objsync_core::MemoryStore::new());
        store.create_bucket("bucket");
        let manager = SyncManager::new(store, TransferConfig::default());
        let report = manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "www").dry_run(true),
            )
            .await
            .unwrap();

        let output = SyncOutput {
            source: "site".into(),
            target: "local/bucket/www".into(),
            report: &report,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["dry_run"], true);
        assert_eq!(json["operations"][0]["kind"], "upload");
        assert_eq!(json["operations"][0]["remote_key"], "www/index.html");
        assert_eq!(json["result"]["files_uploaded"], 0);
        assert!(json["result"]["duration_ms"].is_u64());
    }
}
