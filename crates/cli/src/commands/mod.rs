//! Command implementations
//!
//! Every command takes its parsed arguments plus the global output settings
//! and returns an [`ExitCode`].

use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use objsync_core::{
    AliasManager, CancellationToken, Config, ConfigManager, ParsedPath, RemotePath, parse_path,
};
use objsync_s3::S3Client;

use crate::exit_code::ExitCode;
use crate::output::{Formatter, OutputConfig};

pub mod alias;
pub mod completions;
pub mod ls;
pub mod put;
pub mod rm;
pub mod sync;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage storage aliases
    #[command(subcommand)]
    Alias(alias::AliasCommands),

    /// List objects under one or more prefixes
    Ls(ls::LsArgs),

    /// Upload a local file
    Put(put::PutArgs),

    /// Remove objects
    Rm(rm::RmArgs),

    /// Synchronize a local directory to a bucket prefix
    Sync(sync::SyncArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}

/// Run a parsed command
pub async fn execute(
    command: Commands,
    output_config: OutputConfig,
    cancel: CancellationToken,
) -> ExitCode {
    match command {
        Commands::Alias(cmd) => alias::execute(cmd, output_config).await,
        Commands::Ls(args) => ls::execute(args, output_config, cancel).await,
        Commands::Put(args) => put::execute(args, output_config, cancel).await,
        Commands::Rm(args) => rm::execute(args, output_config, cancel).await,
        Commands::Sync(args) => sync::execute(args, output_config, cancel).await,
        Commands::Completions(args) => completions::execute(args),
    }
}

/// A connected client plus the configuration it was built from
pub(crate) struct Session {
    pub client: Arc<S3Client>,
    pub config: Config,
}

impl Session {
    /// Load the configuration and connect to the alias' endpoint
    pub async fn open(alias: &str, cancel: &CancellationToken) -> anyhow::Result<Self> {
        let manager = ConfigManager::new().context("Failed to locate configuration")?;
        let config = manager
            .load()
            .with_context(|| format!("Failed to load {}", manager.path().display()))?;

        let alias = AliasManager::with_config_manager(manager).get(alias)?;
        let client = S3Client::new(alias, config.retry.clone())
            .await
            .context("Failed to create client")?
            .with_cancel(cancel.clone());

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }
}

/// Parse an argument that must be a remote path
pub(crate) fn remote_path(input: &str) -> objsync_core::Result<RemotePath> {
    match parse_path(input)? {
        ParsedPath::Remote(path) => Ok(path),
        ParsedPath::Local(path) => Err(objsync_core::Error::InvalidPath(format!(
            "Expected alias/bucket[/key], got local path {}",
            path.display()
        ))),
    }
}

/// Report an error and turn it into an exit code
pub(crate) fn fail(formatter: &Formatter, error: &anyhow::Error) -> ExitCode {
    formatter.error(&format!("{error:#}"));
    ExitCode::from_anyhow(error)
}
