//! sensehub daemon entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v`/`-q` flags shift the config level)
//!   4. Init logger once
//!   5. Build the component catalog and registry
//!   6. Start the timer service and coordinator
//!   7. Register configured subscriptions
//!   8. Run until Ctrl-C, then unrequest everything and shut down

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sensehub::builtin::{self, Environment, LogListener};
use sensehub::config::{self, Config};
use sensehub::error::AppError;
use sensehub::logger;
use sensehub::{ComponentRegistry, DaemonHandle, ListenerId, TokioTimerService};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Load .env if present; ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let config = config::load(args.config_path.as_deref())?;

    let forced = args.verbosity != 0;
    let level = if forced {
        logger::shift_level(&config.log_level, args.verbosity)?
    } else {
        config.log_level.as_str()
    };
    logger::init(level, forced)?;

    info!(
        name = %config.name,
        log_level = %level,
        subscriptions = config.subscriptions.len(),
        "config loaded"
    );

    let shutdown = CancellationToken::new();
    let daemon = start(&config, shutdown.clone())?;
    let listeners = subscribe(&config, &daemon).await;

    match daemon.status().await {
        Ok(status) => match serde_json::to_string_pretty(&status) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "could not render status"),
        },
        Err(e) => warn!(error = %e, "status unavailable"),
    }

    // Ctrl-C → graceful shutdown.
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");

    for id in listeners {
        if let Err(e) = daemon.unrequest_data(id.clone(), None).await {
            warn!(listener = %id, error = %e, "unrequest failed");
        }
    }
    daemon.shutdown().await?;
    shutdown.cancel();

    info!("shutdown complete");
    Ok(())
}

fn start(config: &Config, shutdown: CancellationToken) -> Result<DaemonHandle, AppError> {
    let catalog = config.apply_component_defaults(builtin::catalog())?;
    info!(types = ?catalog.type_names(), "component catalog ready");

    let env = Environment::new(tokio::runtime::Handle::current());
    let registry = Arc::new(ComponentRegistry::new(catalog, builtin::capabilities(env)));

    let timer = TokioTimerService::spawn(
        Duration::from_millis(config.scheduler.inexact_window_ms),
        shutdown.child_token(),
    );

    let (daemon, _task) = DaemonHandle::spawn(
        registry,
        Arc::new(timer),
        config.scheduler.command_buffer,
        shutdown.child_token(),
    );
    Ok(daemon)
}

/// Register every configured subscription with a logging listener. A
/// rejected subscription is logged and skipped.
async fn subscribe(config: &Config, daemon: &DaemonHandle) -> Vec<ListenerId> {
    let mut ids = Vec::new();
    for sub in &config.subscriptions {
        let id = match &sub.listener {
            Some(name) => ListenerId::new(name.as_str()),
            None => ListenerId::unique("subscription"),
        };
        let listener = LogListener::handle(id.as_str());
        match daemon
            .request_data_with(listener, sub.config.clone(), sub.schedule, None)
            .await
        {
            Ok(descriptor) => {
                info!(listener = %id, component = %descriptor, "subscription registered");
                ids.push(id);
            }
            Err(e) => warn!(listener = %id, error = %e, "subscription rejected"),
        }
    }
    ids
}

struct CliArgs {
    config_path: Option<PathBuf>,
    /// Net `-v` minus `-q` count.
    verbosity: i32,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0i32;
    let mut config_path = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: sensehub [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -v, -vv, -vvv              Log more than the configured level");
                println!("  -q, -qq                    Log less than the configured level");
                std::process::exit(0);
            }
            "-f" | "--config" => {
                if let Some(path) = iter.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--verbose" => verbosity += 1,
            "--quiet" => verbosity -= 1,
            a if a.len() > 1 && a.starts_with('-') && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity += (a.len() - 1) as i32;
            }
            a if a.len() > 1 && a.starts_with('-') && a.chars().skip(1).all(|c| c == 'q') => {
                verbosity -= (a.len() - 1) as i32;
            }
            other => {
                eprintln!("warning: ignoring unknown argument '{other}'");
            }
        }
    }

    CliArgs { config_path, verbosity }
}
