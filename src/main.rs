//! zoneroute - Geo-aware HTTP request dispatcher
//!
//! Resolves each client to a network zone, picks a backend server according
//! to the virtual host's per-node balance policy and answers with an HTTP
//! redirect. An admin API mutates node and server attributes at runtime and
//! reads traffic counters.

use clap::Parser;
use std::path::PathBuf;
use std::process;
use tracing::info;
use zoneroute::{config::Config, daemon, error::Error, error::Result, proxy};

#[derive(Parser)]
#[command(name = "zoneroute")]
#[command(about = "Geo-aware HTTP request dispatcher", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration directory
    #[arg(short = 'c', value_name = "DIR", env = "ZONEROUTE_CONFIG")]
    config: PathBuf,

    /// PID file path
    #[arg(short = 'p', value_name = "FILE", default_value = "/tmp/zoneroute.pid")]
    pidfile: PathBuf,

    /// Assume the identity of <USER> when started as root
    #[arg(short = 'u', value_name = "USER", default_value = "root")]
    user: String,

    /// Worker threads (0 keeps the runtime default)
    #[arg(short = 'n', value_name = "NCPU", default_value_t = 0)]
    ncpu: usize,

    /// Listen address, `host:port` or bare `:port`
    #[arg(short = 'l', value_name = "ADDR", default_value = ":8080")]
    listen: String,

    /// Stay in the foreground and log to the terminal
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ZONEROUTE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config {
        config_dir: cli.config,
        listen: cli.listen,
        pid_file: cli.pidfile,
        user: cli.user,
        worker_threads: cli.ncpu,
        foreground: cli.foreground,
    };

    let manager = daemon::DaemonManager::new(config.pid_file.clone());
    if manager.is_running() {
        return Err(Error::Server(
            "zoneroute is already running; remove the PID file if that is wrong".into(),
        ));
    }

    if config.foreground {
        init_tracing(&cli.log_level, None)?;
        manager.write_pid_and_drop_privileges(&config.user)?;
    } else {
        manager.daemonize(&config.user)?;
        // Now in the daemon child; logs go next to the PID file.
        init_tracing(&cli.log_level, Some(manager.log_path().to_path_buf()))?;
    }

    // The PID file exists from here on; clean it up on any exit path,
    // including a failed model load.
    let result = serve(config);
    manager.remove_pid();
    result
}

fn serve(config: Config) -> Result<()> {
    info!("zoneroute v{} starting", env!("CARGO_PKG_VERSION"));

    // Load and validate the dispatch model before spinning up the runtime;
    // configuration errors must fail startup.
    let server = proxy::DispatchServer::new(config.clone())?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = builder
        .build()
        .map_err(|e| Error::Server(format!("failed to build runtime: {}", e)))?;

    runtime.block_on(async move {
        let shutdown = server.shutdown_handle();
        let (_signal_tx, mut signal_rx) = daemon::signals::setup_signal_handlers();
        tokio::spawn(async move {
            let _ = signal_rx.recv().await;
            let _ = shutdown.send(());
        });
        server.run().await
    })
}

fn init_tracing(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::sync::Arc::new(file)).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
        }
    }

    Ok(())
}
