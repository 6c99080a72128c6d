mod error;
mod logging;
mod scheduler;
mod settings;
mod single_instance;
mod transport;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use glint_platform::AppPaths;
use glint_update::{
    Channel, InstallOutcome, IpcBridge, JsonSettingsStore, ManifestClient, NotificationRegistry,
    PlatformInstaller, UiTransport, UpdateLifecycle, UpdateStatus, Version,
};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::settings::AppSettings;
use crate::single_instance::SingleInstance;
use crate::transport::{LineTransport, LoopExit};

#[derive(Debug, Parser)]
#[command(name = "glint", about = "Glint update service", version)]
struct Cli {
    /// Record debug-level messages in the updater log
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the updater to a UI process over stdin/stdout (default)
    Serve,
    /// Run one update check and print the resulting status as JSON
    Check {
        /// Switch to this release channel before checking
        #[arg(long, value_parser = parse_channel)]
        channel: Option<Channel>,
    },
    /// Print the running version and the channel it belongs to
    Version,
}

fn parse_channel(raw: &str) -> Result<Channel, String> {
    Channel::from_name(raw).ok_or_else(|| {
        let known: Vec<&str> = Channel::ALL.iter().map(|channel| channel.as_str()).collect();
        format!("unknown channel {raw:?}, expected one of {}", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("glint: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let current = Version::parse(env!("CARGO_PKG_VERSION"))
        .map_err(|error| AppError::message(format!("invalid build version: {error}")))?;

    let command = cli.command.unwrap_or(Command::Serve);
    if let Command::Version = command {
        println!("glint {current} ({})", current.channel());
        return Ok(());
    }

    let paths = AppPaths::new()?;
    paths
        .ensure_dirs()
        .map_err(|error| AppError::paths_unavailable(error.to_string()))?;

    let settings = AppSettings::load(&paths.settings_file());
    logging::init_logging(
        &paths.log_file(),
        cli.debug || settings.debug_logging,
        settings.max_log_size_bytes,
    );

    let _instance = SingleInstance::acquire(&paths.instance_lock_file())?;
    let lifecycle = Arc::new(build_lifecycle(current, &settings, &paths)?);

    match command {
        Command::Check { channel } => check_once(&lifecycle, channel).await,
        Command::Serve | Command::Version => serve(lifecycle, &settings).await,
    }
}

fn build_lifecycle(
    current: Version,
    settings: &AppSettings,
    paths: &AppPaths,
) -> Result<UpdateLifecycle, AppError> {
    let client = ManifestClient::new(settings.client_config())
        .map_err(|error| AppError::updater_start_failed("manifest client", &error))?;

    UpdateLifecycle::new(
        current,
        Arc::new(client),
        Arc::new(PlatformInstaller),
        Arc::new(JsonSettingsStore::new(paths.settings_file())),
        paths.update_download_dir(),
    )
    .map_err(|error| AppError::updater_start_failed("update lifecycle", &error))
}

async fn check_once(
    lifecycle: &UpdateLifecycle,
    channel: Option<Channel>,
) -> Result<(), AppError> {
    let status = match channel {
        Some(channel) => lifecycle
            .set_channel(channel)
            .await
            .map_err(|error| AppError::update_check_failed(channel.to_string(), &error))?,
        None => lifecycle.check_for_updates(false).await,
    };

    let rendered = serde_json::to_string_pretty(&status)
        .map_err(|error| AppError::message(format!("failed to render status: {error}")))?;
    println!("{rendered}");

    match status {
        UpdateStatus::Error { message, .. } => Err(AppError::update_check_failed(
            lifecycle.effective_channel().to_string(),
            message,
        )),
        _ => Ok(()),
    }
}

async fn serve(lifecycle: Arc<UpdateLifecycle>, settings: &AppSettings) -> Result<(), AppError> {
    let registry = Arc::new(NotificationRegistry::new());
    let bridge = IpcBridge::new(Arc::clone(&lifecycle), Arc::clone(&registry));
    let transport: Arc<dyn UiTransport> = Arc::new(LineTransport::stdout());
    bridge.attach(Arc::clone(&transport));

    let shutdown = CancellationToken::new();
    let auto_check = scheduler::spawn_auto_check(
        Arc::clone(&lifecycle),
        scheduler::STARTUP_CHECK_DELAY,
        settings.check_interval(),
        shutdown.clone(),
    );
    let sweep = scheduler::spawn_red_dot_sweep(
        registry,
        Some(Arc::clone(&transport)),
        settings.red_dot_sweep_interval(),
        shutdown.clone(),
    );
    info!("Serving updater on stdio");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let exit = transport::run_command_loop(stdin, &bridge, transport).await;

    shutdown.cancel();
    lifecycle.cancel_download();
    bridge.detach().await;
    let _ = auto_check.await;
    let _ = sweep.await;

    match exit? {
        LoopExit::InputClosed => info!("UI disconnected, shutting down"),
        LoopExit::Installed(InstallOutcome::ExitForInstaller) => {
            info!("Installer launched, exiting");
        }
        LoopExit::Installed(InstallOutcome::RestartRequired) => {
            info!("Update installed, restarting");
            glint_update::restart_app().map_err(|error| AppError::restart_failed(&error))?;
        }
    }
    Ok(())
}
