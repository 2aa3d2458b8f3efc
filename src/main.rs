//! Mount a remote drive as a filesystem, fetching only what is read.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::trc::Logging;

#[derive(Parser)]
#[command(version, about = "A lazily fetched, locally cached filesystem for remote drives.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a drive-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the filesystem and serve it until interrupted.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();
    let Command::Run { daemonize } = args.command.unwrap_or(Command::Run { daemonize: false });

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = fuse_check::ensure_fuse() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if !daemonize {
        init_tracing(false);
        if let Err(e) = daemon::spawn(config) {
            error!("Daemon failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Safe: Config.validate() guarantees pid_file's parent exists.
    let pid_file_parent = config
        .daemon
        .pid_file
        .parent()
        .unwrap_or_else(|| unreachable!("Config.validate() ensures pid_file has a parent"));
    if let Err(e) = std::fs::create_dir_all(pid_file_parent) {
        eprintln!("Failed to create PID file directory: {e}");
        std::process::exit(1);
    }

    let mut daemonize = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);

    if let Some(path) = &config.daemon.log_file {
        let opened = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|file| file.try_clone().map(|clone| (file, clone)));
        match opened {
            Ok((stdout, stderr)) => daemonize = daemonize.stdout(stdout).stderr(stderr),
            Err(e) => {
                eprintln!("Failed to open log file '{}': {e}", path.display());
                std::process::exit(1);
            }
        }
    }

    match daemonize.start() {
        Ok(()) => {
            // The subscriber is installed after the fork, so it writes to the redirected stderr.
            init_tracing(true);
            debug!(config = ?config, "Initializing daemon with configuration...");
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Failed to spawn the daemon: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(daemonize: bool) {
    Logging::from_env().detached(daemonize).install().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });
}
