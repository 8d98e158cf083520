use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use lighthouse::config::Config;
use lighthouse::library::Library;
use lighthouse::logging;

/// Interval between status lines in the log.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Args {
    config_path: Option<PathBuf>,
    track: Vec<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("lighthouse {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--track" | "-t" => {
                if i + 1 < args.len() {
                    parsed.track.push(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --track requires a path argument");
                    std::process::exit(1);
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"lighthouse - incremental photo indexer

USAGE:
    lighthouse [OPTIONS]

OPTIONS:
    --config, -c PATH   Path to config file
    --track, -t PATH    Track a photo directory (repeatable)
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    LIGHTHOUSE_CONFIG   Path to config file (overrides default location)
    LIGHTHOUSE_LOG      Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/lighthouse/config.toml"#
    );
}

fn log_status(library: &Library) {
    match library.status() {
        Ok(status) => {
            let online = status
                .roots
                .iter()
                .filter(|r| r.root.status == lighthouse::db::RootStatus::Online)
                .count();
            info!(
                roots = status.roots.len(),
                online,
                photos = status.photos_total,
                scan_queue = status.indexer.scan_queue_len,
                ingest_queue = status.indexer.ingest_queue_len,
                failed = status.indexer.failed_total,
                "Status"
            );
        }
        Err(e) => warn!(error = %format!("{:#}", e), "Status unavailable"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if let Err(e) = logging::init(Some(Config::config_dir().join("logs"))) {
        eprintln!("Logging unavailable: {:#}", e);
    }

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    let library = Arc::new(Library::open(config)?);
    library.start()?;

    let configured = library.config().roots.clone();
    for path in configured {
        match library.find_root(&path) {
            Ok(Some(_)) => {}
            _ => {
                if let Err(e) = library.track_root(&path) {
                    warn!(path = %path.display(), error = %format!("{:#}", e), "Configured root not tracked");
                }
            }
        }
    }
    for path in &args.track {
        if let Err(e) = library.track_root(path) {
            error!(path = %path.display(), error = %format!("{:#}", e), "Failed to track root");
        }
    }

    info!("Lighthouse running, press Ctrl-C to stop");
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&library),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Signal handler failed");
                }
                break;
            }
        }
    }

    let lib = Arc::clone(&library);
    tokio::task::spawn_blocking(move || lib.shutdown()).await?;
    info!("Lighthouse stopped");
    Ok(())
}
