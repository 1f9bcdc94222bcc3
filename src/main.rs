mod cli;
mod ops;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    // RUST_LOG wins over -v
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Backup {
            path,
            tags,
            parent,
            force_full,
            policy,
            volume_mode,
        } => {
            let request = ops::BackupArgs {
                path: path.clone(),
                tags: tags.iter().cloned().collect(),
                parent: parent.clone(),
                force_full: *force_full,
                policy: policy.clone(),
                volume_mode: *volume_mode,
            };
            ops::do_backup(&cli, request)?;
        }
        Commands::Restore {
            snapshot,
            target,
            volume_mode,
        } => {
            ops::do_restore(&cli, snapshot, target, *volume_mode)?;
        }
        Commands::Version => {
            ops::do_version();
        }
    }

    Ok(())
}
