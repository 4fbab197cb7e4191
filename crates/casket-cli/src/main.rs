#![deny(clippy::all, warnings)]

use std::path::PathBuf;

use casket::{Cache, VerifyOptions};
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(author, version, about = "Content-addressed cache maintenance")]
struct CasketCli {
    /// Cache root (defaults to CASKET_CACHE_PATH or the platform cache dir)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,
    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Re-check every cached entry, repair the index, and drop orphaned
    /// content
    Verify {
        /// Bound on parallel integrity checks
        #[arg(long, default_value_t = 20)]
        concurrency: usize,
    },
    /// Print the timestamp of the last successful verification
    LastRun,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = CasketCli::parse();
    init_tracing(cli.verbose);

    let cache = Cache::new(cli.cache.clone()).map_err(|err| eyre!("{err:?}"))?;
    match cli.command {
        Command::Verify { concurrency } => {
            let options = VerifyOptions {
                concurrency,
                ..VerifyOptions::default()
            };
            let stats = cache.verify(&options).map_err(|err| eyre!("{err:?}"))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "verified {} entries ({} distinct blobs); reclaimed {} files ({} bytes) in {} ms",
                    stats.total_entries,
                    stats.verified_content,
                    stats.reclaimed_count,
                    stats.reclaimed_size,
                    stats.run_time
                );
            }
        }
        Command::LastRun => {
            let last_run = cache.last_run().map_err(|err| eyre!("{err:?}"))?;
            if cli.json {
                println!("{}", json!({ "lastRun": last_run }));
            } else {
                match last_run {
                    Some(stamp) => println!("{stamp}"),
                    None => println!("never verified"),
                }
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("casket={level},casket_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
