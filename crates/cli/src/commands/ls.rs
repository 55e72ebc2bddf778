//! ls command - List objects
//!
//! One path is listed page by page; several paths under the same alias and
//! bucket are listed concurrently and merged into one stream.

use std::sync::Arc;

use clap::Args;
use futures::StreamExt;
use objsync_core::{
    CancellationToken, ListConfig, ObjectInfo, ObjectStore, Paginator, RemotePath, Result,
    StreamingLister,
};
use serde::Serialize;

use super::{Session, fail, remote_path};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// List objects under one or more prefixes
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Paths to list (alias/bucket[/prefix]); several paths must share alias and bucket
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// List every object below the prefix instead of one level
    #[arg(short, long)]
    pub recursive: bool,

    /// Objects per list request (1-1000)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Prefixes listed concurrently when several paths are given
    #[arg(short = 'P', long)]
    pub parallel: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    key: String,
    is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

impl From<ObjectInfo> for LsEntry {
    fn from(object: ObjectInfo) -> Self {
        Self {
            key: object.key,
            is_dir: false,
            size: Some(object.size),
            last_modified: object.last_modified.map(|t| t.to_string()),
            etag: object.etag,
        }
    }
}

#[derive(Debug, Serialize)]
struct LsOutput {
    items: Vec<LsEntry>,
    /// Pages fetched for a single-path listing
    #[serde(skip_serializing_if = "Option::is_none")]
    pages: Option<usize>,
}

/// Execute the ls command
pub async fn execute(args: LsArgs, output_config: OutputConfig, cancel: CancellationToken) -> ExitCode {
    let formatter = Formatter::new(output_config);

    let paths = match args
        .paths
        .iter()
        .map(|p| remote_path(p))
        .collect::<Result<Vec<_>>>()
    {
        Ok(paths) => paths,
        Err(e) => {
            formatter.error(&e.to_string());
            return ExitCode::UsageError;
        }
    };

    let first = &paths[0];
    if paths
        .iter()
        .any(|p| p.alias != first.alias || p.bucket != first.bucket)
    {
        formatter.error("All paths must use the same alias and bucket");
        return ExitCode::UsageError;
    }

    let session = match Session::open(&first.alias, &cancel).await {
        Ok(s) => s,
        Err(e) => return fail(&formatter, &e),
    };
    let page_size = args
        .page_size
        .unwrap_or_else(|| session.config.transfer.effective_page_size());
    let parallelism = args
        .parallel
        .unwrap_or(session.config.transfer.list_parallelism);
    let store: Arc<dyn ObjectStore> = session.client;

    let listing = if paths.len() == 1 {
        list_one(store, &cancel, first, args.recursive, page_size).await
    } else {
        list_many(store, &cancel, &paths, page_size, parallelism).await
    };

    match listing {
        Ok(output) => {
            render(&formatter, &output);
            ExitCode::Success
        }
        Err(e) => {
            formatter.error(&format!("Failed to list {first}: {e}"));
            ExitCode::from_error(&e)
        }
    }
}

/// Page through a single prefix
async fn list_one(
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    path: &RemotePath,
    recursive: bool,
    page_size: usize,
) -> Result<LsOutput> {
    let mut paginator = Paginator::new(store, &path.bucket, &path.key, page_size);
    if !recursive {
        paginator = paginator.with_delimiter("/");
    }

    let mut items = Vec::new();
    while paginator.has_more_pages() {
        let page = paginator.next_page(cancel).await?;
        items.extend(page.common_prefixes.into_iter().map(|key| LsEntry {
            key,
            is_dir: true,
            size: None,
            last_modified: None,
            etag: None,
        }));
        items.extend(page.objects.into_iter().map(LsEntry::from));
    }

    Ok(LsOutput {
        items,
        pages: Some(paginator.pages_fetched()),
    })
}

/// Fan out over several prefixes and merge the results
async fn list_many(
    store: Arc<dyn ObjectStore>,
    cancel: &CancellationToken,
    paths: &[RemotePath],
    page_size: usize,
    parallelism: usize,
) -> Result<LsOutput> {
    let base = ListConfig::new(&paths[0].bucket).with_page_size(page_size);
    let prefixes = paths.iter().map(|p| p.key.clone()).collect();
    let mut stream = StreamingLister::new(store).list_prefixes_with(cancel, base, prefixes, parallelism);

    let mut items = Vec::new();
    while let Some(object) = stream.next().await {
        items.push(LsEntry::from(object?));
    }
    items.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(LsOutput { items, pages: None })
}

fn render(formatter: &Formatter, output: &LsOutput) {
    if formatter.is_json() {
        formatter.json(output);
        return;
    }

    for item in &output.items {
        if item.is_dir {
            formatter.println(&format!(
                "{:>21} {:>10} {}",
                "",
                "PRE",
                formatter.style_dir(&item.key)
            ));
            continue;
        }

        let date = item.last_modified.as_deref().unwrap_or("-");
        let size = item.size.map(|s| formatter.size(s)).unwrap_or_default();
        formatter.println(&format!(
            "{} {:>10} {}",
            formatter.style_date(&format!("[{date:<19}]")),
            size,
            formatter.style_file(&item.key)
        ));
    }
}
