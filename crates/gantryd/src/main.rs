use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use libgantry::config;
use libgantry::container::Manager;
use libgantry::daemon::Server;
use libgantry::image::{HelperPuller, ImageStore};
use libgantry::process::init as container_init;
use libgantry::store::Store;

mod observability;

#[derive(Parser, Debug)]
#[command(version, about = "A daemon-based Linux container runtime")]
struct Opts {
    /// change log level to debug
    #[arg(long)]
    debug: bool,

    /// set the log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// set the log format (text, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// in-container init; selected by the daemon when it re-executes
    /// itself inside the new namespaces
    #[command(hide = true)]
    Init,
}

impl From<&Opts> for observability::ObservabilityConfig {
    fn from(opts: &Opts) -> Self {
        Self {
            log_debug_flag: opts.debug,
            log_level: opts.log_level.clone(),
            log_file: opts.log_file.clone(),
            log_format: opts.log_format.clone(),
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    observability::init(&opts).context("failed to initialize logging")?;

    match opts.command {
        Some(Command::Init) => run_init(),
        None => run_daemon(),
    }
}

/// PID 1 inside the new namespaces. Never returns on success (the
/// payload replaces this process); on failure the exit status tells the
/// parent what class of failure it was.
fn run_init() -> Result<()> {
    match container_init::run() {
        Ok(never) => match never {},
        Err(err) => {
            tracing::error!(%err, "container init failed");
            std::process::exit(err.exit_code());
        }
    }
}

fn run_daemon() -> Result<()> {
    let store = Store::new(config::STORAGE_ROOT);
    store
        .ensure_layout()
        .context("storage root is not usable")?;

    let manager = Manager::new().context("failed to construct container manager")?;
    let images = ImageStore::new(store.images_dir());
    let puller = Arc::new(HelperPuller::new(config::PULL_HELPER, images.clone()));

    let server = Server::new(manager, images, puller, PathBuf::from(config::SOCKET_PATH));
    server.run().context("daemon failed")?;
    Ok(())
}
