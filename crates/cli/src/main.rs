//! objsync - bulk transfer and sync for S3-compatible object storage

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;

use commands::Commands;
use output::OutputConfig;

#[derive(Parser, Debug)]
#[command(name = "objsync", version, about, propagate_version = true)]
pub struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log engine activity at debug level to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let output_config = OutputConfig {
        json: cli.json,
        no_color: cli.no_color,
        quiet: cli.quiet,
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling");
            interrupt.cancel();
        }
    });

    commands::execute(cli.command, output_config, cancel)
        .await
        .into()
}

/// Logs go to stderr; `RUST_LOG` wins unless `--debug` is given
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("warn,objsync=debug,objsync_core=debug,objsync_s3=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["objsync", "ls", "local/bucket", "--json", "-q"]).unwrap();
        assert!(cli.json);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Ls(_)));
    }

    #[test]
    fn test_sync_flags() {
        let cli = Cli::try_parse_from([
            "objsync",
            "sync",
            "./site",
            "local/bucket/www",
            "--delete",
            "--exclude",
            "*.tmp",
            "--exclude",
            ".git/*",
            "-P",
            "4",
        ])
        .unwrap();

        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.delete);
        assert!(!args.dry_run);
        assert_eq!(args.exclude, vec!["*.tmp", ".git/*"]);
        assert_eq!(args.parallel, Some(4));
    }

    #[test]
    fn test_rm_requires_path() {
        assert!(Cli::try_parse_from(["objsync", "rm"]).is_err());
    }
}
