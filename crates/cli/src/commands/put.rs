//! put command - Upload a local file
//!
//! Files at or above the multipart threshold are uploaded in parts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use objsync_core::{
    CancellationToken, Error, ObjectStore, RemotePath, Result, TransferConfig, UploadResult,
    UploadStrategy, Uploader,
};
use serde::Serialize;

use super::{Session, fail, remote_path};
use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

/// Upload a local file
#[derive(Args, Debug)]
pub struct PutArgs {
    /// Local file to upload
    pub source: PathBuf,

    /// Destination (alias/bucket/key, or alias/bucket/prefix/ to keep the file name)
    pub target: String,
}

#[derive(Debug, Serialize)]
struct PutOutput {
    source: String,
    target: String,
    #[serde(flatten)]
    upload: UploadResult,
}

impl fmt::Display for PutOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let how = match self.upload.strategy {
            UploadStrategy::Simple => "single request".to_string(),
            UploadStrategy::Multipart => format!("{} parts", self.upload.parts),
        };
        write!(f, "{} -> {} ({how})", self.source, self.target)
    }
}

/// Execute the put command
pub async fn execute(args: PutArgs, output_config: OutputConfig, cancel: CancellationToken) -> ExitCode {
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

    match upload(
        session.client,
        &session.config.transfer,
        &cancel,
        &args.source,
        &target,
    )
    .await
    {
        Ok(result) => {
            let size = formatter.size(result.size);
            let output = PutOutput {
                source: args.source.display().to_string(),
                target: RemotePath::new(&target.alias, &target.bucket, &result.key).to_string(),
                upload: result,
            };
            formatter.output(&output);
            if let Some(etag) = &output.upload.etag {
                formatter.println(&format!("{} {etag}", formatter.style_key("etag:")));
            }
            formatter.success(&format!("Uploaded {size}"));
            ExitCode::Success
        }
        Err(e) => {
            formatter.error(&format!("Failed to upload {}: {e}", args.source.display()));
            ExitCode::from_error(&e)
        }
    }
}

async fn upload(
    store: Arc<dyn ObjectStore>,
    transfer: &TransferConfig,
    cancel: &CancellationToken,
    source: &Path,
    target: &RemotePath,
) -> Result<UploadResult> {
    let key = target_key(target, source)?;
    tracing::info!(source = %source.display(), bucket = %target.bucket, key = %key, "Uploading file");

    Uploader::new(store, transfer)
        .upload_file(cancel, &target.bucket, &key, source)
        .await
}

/// Object key for `source`; a prefix target keeps the file name
fn target_key(target: &RemotePath, source: &Path) -> Result<String> {
    if !target.key.is_empty() && !target.key.ends_with('/') {
        return Ok(target.key.clone());
    }

    let name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(format!("{} has no file name", source.display())))?;
    Ok(target.join(name))
}
