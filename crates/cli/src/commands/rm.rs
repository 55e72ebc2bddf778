//! rm command - Remove objects
//!
//! Plain keys are deleted in batches. With `--recursive`, a background
//! listing feeds keys straight into a streaming delete consumer, so deletion
//! starts before the listing finishes.

use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Args;
use futures::StreamExt;
use objsync_core::{
    BatchDeleter, CancellationToken, DeleteResult, Error, ListConfig, ObjectStore,
    OptimizedDeleter, RemotePath, Result, StreamingDeleteConsumer, StreamingLister,
};
use serde::Serialize;
use tokio::sync::mpsc;

use super::{Session, fail, remote_path};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Remove objects
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Objects or prefixes to remove (alias/bucket/key); all must share one alias
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Remove every object below each path
    #[arg(short, long)]
    pub recursive: bool,

    /// Show what would be removed without removing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Delete batches in flight at once
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct RmSettings {
    batch_size: usize,
    page_size: usize,
    parallelism: usize,
}

#[derive(Debug, Serialize)]
struct RmOutput {
    #[serde(flatten)]
    result: DeleteResult,
    dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Execute the rm command
pub async fn execute(args: RmArgs, output_config: OutputConfig, cancel: CancellationToken) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let targets = match args
        .paths
        .iter()
        .map(|p| remote_path(p))
        .collect::<Result<Vec<_>>>()
    {
        Ok(targets) => targets,
        Err(e) => {
            formatter.error(&e.to_string());
            return ExitCode::UsageError;
        }
    };

    let alias = &targets[0].alias;
    if targets.iter().any(|t| &t.alias != alias) {
        formatter.error("All paths must use the same alias");
        return ExitCode::UsageError;
    }
    if !args.recursive && let Some(t) = targets.iter().find(|t| t.key.is_empty() || t.key.ends_with('/')) {
        formatter.error(&format!("{t} is a prefix; use --recursive to remove everything below it"));
        return ExitCode::UsageError;
    }

    let session = match Session::open(alias, &cancel).await {
        Ok(s) => s,
        Err(e) => return fail(&formatter, &e),
    };
    let transfer = &session.config.transfer;
    let settings = RmSettings {
        batch_size: transfer.batch_size(),
        page_size: transfer.effective_page_size(),
        parallelism: args.parallel.unwrap_or(transfer.delete_parallelism),
    };
    let store: Arc<dyn ObjectStore> = session.client;

    if args.dry_run {
        return match preview(store, &cancel, &targets, args.recursive, settings).await {
            Ok(keys) => {
                render_preview(&formatter, alias, &keys);
                ExitCode::Success
            }
            Err(e) => {
                formatter.error(&format!("Failed to list objects: {e}"));
                ExitCode::from_error(&e)
            }
        };
    }

    let (result, error) = if args.recursive {
        remove_prefixes(store, &cancel, &targets, settings).await
    } else {
        let deleter = OptimizedDeleter::from_config(store, transfer);
        remove_keys(&deleter, &cancel, &targets).await
    };

    render(&formatter, &result, error.as_ref());
    if let Some(e) = &error {
        ExitCode::from_error(e)
    } else if result.resolved() != result.total() || !result.errors.is_empty() {
        ExitCode::GeneralError
    } else {
        ExitCode::Success
    }
}

/// Delete named keys through the auto-flushing buffer, then flush each bucket
async fn remove_keys(
    deleter: &OptimizedDeleter,
    cancel: &CancellationToken,
    targets: &[RemotePath],
) -> (DeleteResult, Option<Error>) {
    let mut total = DeleteResult::default();
    let buckets: BTreeSet<&str> = targets.iter().map(|t| t.bucket.as_str()).collect();

    for (i, target) in targets.iter().enumerate() {
        match deleter
            .delete_with_auto_flush(cancel, &target.bucket, target.key.as_str())
            .await
        {
            Ok(Some(result)) => total.merge(result),
            Ok(None) => {}
            Err(failure) => {
                total.merge(failure.partial);
                total.pending.extend(deleter.take_buffered().await);
                total
                    .pending
                    .extend(targets[i + 1..].iter().map(|t| t.key.clone()));
                return (total, Some(failure.error));
            }
        }
    }

    for bucket in buckets {
        match deleter.flush(cancel, bucket).await {
            Ok(result) => total.merge(result),
            Err(failure) => {
                total.merge(failure.partial);
                total.pending.extend(deleter.take_buffered().await);
                return (total, Some(failure.error));
            }
        }
    }
    (total, None)
}

/// Delete everything below each prefix
async fn remove_prefixes(
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    targets: &[RemotePath],
    settings: RmSettings,
) -> (DeleteResult, Option<Error>) {
    let mut total = DeleteResult::default();
    for target in targets {
        let (result, error) = remove_prefix(store.clone(), cancel, target, settings).await;
        total.merge(result);
        if error.is_some() {
            return (total, error);
        }
    }
    (total, None)
}

async fn remove_prefix(
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    target: &RemotePath,
    settings: RmSettings,
) -> (DeleteResult, Option<Error>) {
    let config = ListConfig::new(&target.bucket)
        .with_prefix(&target.key)
        .with_page_size(settings.page_size);
    let mut objects = StreamingLister::new(store.clone()).list_all(cancel, config);

    let deleter = BatchDeleter::with_batch_size(store, settings.batch_size);
    let (tx, rx) = mpsc::channel(deleter.batch_size());

    // Dropping `tx` at the end of the listing closes the consumer's input
    let forward = async move {
        while let Some(item) = objects.next().await {
            if tx.send(item?.key).await.is_err() {
                break;
            }
        }
        Ok::<(), Error>(())
    };

    let consumer = StreamingDeleteConsumer::new(deleter);
    let (listed, deleted) = tokio::join!(
        forward,
        consumer.delete_stream(cancel, &target.bucket, rx, settings.parallelism),
    );

    let outcome = match (deleted, listed) {
        (Ok(result), Ok(())) => (result, None),
        (Ok(result), Err(e)) => (result, Some(e)),
        (Err(failure), _) => (failure.partial, Some(failure.error)),
    };
    tracing::info!(
        target = %target,
        deleted = outcome.0.deleted.len(),
        errors = outcome.0.errors.len(),
        "Recursive remove finished"
    );
    outcome
}

/// Keys that a real run would try to delete
async fn preview(
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    targets: &[RemotePath],
    recursive: bool,
    settings: RmSettings,
) -> Result<Vec<RemotePath>> {
    if !recursive {
        return Ok(targets.to_vec());
    }

    let lister = StreamingLister::new(store);
    let mut keys = Vec::new();
    for target in targets {
        let config = ListConfig::new(&target.bucket)
            .with_prefix(&target.key)
            .with_page_size(settings.page_size);
        let mut objects = lister.list_all(cancel, config);
        while let Some(item) = objects.next().await {
            let object = item?;
            keys.push(RemotePath::new(&target.alias, &target.bucket, object.key));
        }
    }
    Ok(keys)
}

fn render_preview(formatter: &Formatter, alias: &str, keys: &[RemotePath]) {
    if formatter.is_json() {
        let output = serde_json::json!({
            "alias": alias,
            "dry_run": true,
            "would_remove": keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        });
        formatter.json(&output);
        return;
    }

    for key in keys {
        formatter.println(&format!("Would remove {}", formatter.style_file(&key.to_string())));
    }
    formatter.println(&format!("{} object(s) would be removed", keys.len()));
}

fn render(formatter: &Formatter, result: &DeleteResult, error: Option<&Error>) {
    if formatter.is_json() {
        formatter.json(&RmOutput {
            result: result.clone(),
            dry_run: false,
            error: error.map(|e| e.to_string()),
        });
        return;
    }

    for failed in &result.errors {
        formatter.error(&format!(
            "Failed to remove {}: {} ({})",
            failed.key, failed.message, failed.code
        ));
    }
    if !result.unknown.is_empty() {
        formatter.warning(&format!(
            "{} object(s) were in a failed request and may or may not have been removed",
            result.unknown.len()
        ));
    }
    if !result.pending.is_empty() {
        formatter.warning(&format!(
            "{} object(s) were not attempted",
            result.pending.len()
        ));
    }
    if let Some(e) = error {
        formatter.error(&e.to_string());
    }

    formatter.success(&format!("Removed {} object(s)", result.deleted.len()));
}
