//! Host process entry point: parses the command-line surface, loads
//! configuration, and brings up the core components in dependency order.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use lithium_core::bus::MessageBus;
use lithium_core::cli::{Cli, exit_code};
use lithium_core::config::Config;
use lithium_core::dispatcher::CommandDispatcher;
use lithium_core::event_loop::{EventLoop, EventLoopConfig};
use lithium_core::guider::GuiderClient;
use lithium_core::registry::{ServiceRegistry, ids};
use lithium_core::script::{ScriptAnalyzer, ScriptManager};
use lithium_core::sequencer::Sequencer;
use tracing::{debug, info, warn};

fn setup_logging(debug_mode: bool, extra_sink: Option<&PathBuf>) -> Result<PathBuf> {
    let log_dir = PathBuf::from("logs");
    fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let run_name = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let log_path = log_dir.join(format!("{run_name}.log"));
    let log_file = fs::File::create(&log_path).context("failed to create log file")?;

    let level = if debug_mode { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt().with_writer(log_file).with_ansi(false).with_env_filter(filter).init();

    if let Some(extra) = extra_sink {
        info!(?extra, "additional log sink requested but not yet wired as a second writer");
    }

    Ok(log_path)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    match run().await {
        Ok(()) => std::process::ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("fatal: {e:?}");
            std::process::ExitCode::from(exit_code::FATAL_INIT_ERROR as u8)
        }
    }
}

async fn run() -> Result<()> {
    let cli = match Cli::parse_checked() {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            std::process::exit(exit_code::INVALID_ARGUMENTS);
        }
    };

    let log_path = setup_logging(cli.debug, cli.log_file.as_ref()).context("failed to set up logging")?;
    info!(?log_path, "logging initialized");

    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    debug!(?config, "main: configuration loaded");

    if let Some(module_path) = &cli.module_path {
        info!(?module_path, "device driver search path overridden from the command line");
    }

    // ============================================================
    // Composition root: build components bottom-up, publishing each
    // to the registry as it becomes available, in reverse teardown order.
    // ============================================================

    let event_loop = Arc::new(EventLoop::start(EventLoopConfig {
        workers: config.event_loop.workers,
        timer_tick: config.event_loop.timer_tick(),
    }));
    info!(workers = config.event_loop.workers, "event loop started");

    let bus = MessageBus::new();

    let dispatcher = Arc::new(CommandDispatcher::new(event_loop.clone()));

    let analyzer = Arc::new(ScriptAnalyzer::new());
    let script_manager = Arc::new(ScriptManager::new(analyzer.clone(), (&config.script_manager).into()));

    fs::create_dir_all(&config.paths.module_dir).context("failed to create module directory")?;
    fs::create_dir_all(&config.paths.script_dir).context("failed to create script directory")?;

    let guider = match GuiderClient::connect((&config.guider).into(), Some(bus.clone())).await {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "guider connection failed at startup; continuing without it");
            None
        }
    };

    let sequencer = Arc::new(Sequencer::new(
        dispatcher.clone(),
        Some(bus.clone()),
        lithium_core::sequencer::SchedulingPolicy::Fifo,
        lithium_core::sequencer::RecoveryPolicy::Abort,
        config.sequencer.max_concurrent,
    ));
    if let Some(seconds) = config.sequencer.global_timeout_seconds {
        sequencer.set_global_timeout(Some(std::time::Duration::from_secs(seconds))).await;
    }

    let registry = ServiceRegistry::new();
    registry.add(ids::EVENT_LOOP, &event_loop);
    registry.add(ids::COMMAND_DISPATCHER, &dispatcher);
    registry.add(ids::SCRIPT_ANALYZER, &analyzer);
    registry.add(ids::SCRIPT_MANAGER, &script_manager);
    registry.add(ids::SEQUENCER, &sequencer);
    if let Some(guider) = &guider {
        registry.add(ids::GUIDER_CLIENT, guider);
    }

    if cli.web_panel {
        info!(host = %cli.host, port = cli.port, "web control panel requested (transport not started by this binary)");
    }
    if cli.debug {
        info!("interactive debug terminal requested (not started by this binary)");
    }

    info!("startup complete; waiting for shutdown signal");
    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    sequencer.stop();
    event_loop.stop(true).await;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => debug!("shutdown_signal: SIGINT received"),
        _ = sigterm.recv() => debug!("shutdown_signal: SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
