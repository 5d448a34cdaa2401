//! slotwatch
//!
//! Watches acceptance slots and notifies chat subscribers when they change.
//!
//! - `slotwatch`: run the scheduler and the bot until interrupted
//! - `slotwatch --once`: run a single cycle and print the report

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use slotwatch_monitor::allocation::{AllocationApi, HttpAllocationApi};
use slotwatch_monitor::bot::CommandBot;
use slotwatch_monitor::config::{Config, SourceConfig};
use slotwatch_monitor::cycle::{CycleResult, PollCycleRunner};
use slotwatch_monitor::notifier::ChangeNotifier;
use slotwatch_monitor::retry::RetryingCaller;
use slotwatch_monitor::scheduler::{CancellableLoop, LoopOutcome};
use slotwatch_monitor::shutdown;
use slotwatch_monitor::source::{DatasetSource, FileSource, SheetsSource};
use slotwatch_monitor::subscribers::{SubscriberRegistry, SubscriberStore};
use slotwatch_monitor::telegram::TelegramClient;
use slotwatch_pacing::{BackoffPolicy, QuotaBook};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "slotwatch", version, about = "Acceptance slot monitor")]
struct Cli {
    /// Window duration and pacing baseline in seconds.
    #[arg(short, long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Run exactly one cycle, print the report and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        quota_per_window = config.quota_per_window,
        window_secs = config.window.as_secs(),
        quota_scope = ?config.quota_scope,
        max_attempts = config.max_attempts,
        once = cli.once,
        "Starting slotwatch"
    );

    let result = if cli.once {
        run_once(config).await
    } else {
        run(config).await
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "slotwatch failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, slotwatch_monitor::config::ConfigError> {
    let config = Config::from_env()?;
    match cli.interval {
        Some(secs) => config.with_window_secs(secs),
        None => Ok(config),
    }
}

fn build_runner(config: &Config, signal: shutdown::ShutdownSignal) -> Result<PollCycleRunner> {
    let source: Arc<dyn DatasetSource> = match &config.source {
        SourceConfig::Sheets {
            api_url,
            spreadsheet_url,
            api_key,
        } => Arc::new(SheetsSource::new(
            api_url,
            spreadsheet_url,
            api_key.clone(),
            config.request_timeout,
            config.max_coefficient,
        )?),
        SourceConfig::File { path } => Arc::new(FileSource::new(path, config.max_coefficient)),
    };

    let api: Arc<dyn AllocationApi> = Arc::new(HttpAllocationApi::new(
        &config.allocation_api_url,
        config.allocation_api_key.clone(),
        config.request_timeout,
    )?);

    let caller = RetryingCaller::new(
        config.max_attempts,
        BackoffPolicy::default(),
        config.request_timeout,
    );
    let quota = QuotaBook::new(config.quota_scope, config.quota_per_window, config.window)?;

    Ok(PollCycleRunner::new(source, api, caller, quota, signal))
}

async fn run_once(config: Config) -> Result<ExitCode> {
    let (_trigger, signal) = shutdown::channel();
    let mut runner = build_runner(&config, signal)?;

    match runner.run_cycle().await {
        CycleResult::Success { snapshot, .. } => {
            println!("{}", snapshot.message());
            Ok(ExitCode::SUCCESS)
        }
        CycleResult::Failure { reason, .. } => {
            eprintln!("cycle failed: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run(config: Config) -> Result<ExitCode> {
    let (trigger, signal) = shutdown::channel();

    let registry = Arc::new(SubscriberRegistry::open(SubscriberStore::new(
        &config.subscriptions_path,
    ))?);
    let telegram = Arc::new(TelegramClient::new(
        &config.telegram_api_url,
        &config.telegram_bot_token,
        config.request_timeout,
    )?);
    let notifier = ChangeNotifier::new(
        Arc::clone(&registry),
        telegram.clone(),
        config.send_spacing,
    )
    .with_shutdown(signal.clone());

    let runner = build_runner(&config, signal.clone())?.with_notifier(Arc::new(notifier));
    let scheduler = CancellableLoop::new(
        runner,
        signal.clone(),
        config.failure_backoff,
        config.shutdown_grace,
    );
    let bot = CommandBot::new(telegram, registry, scheduler.status(), signal);

    let mut scheduler_handle = tokio::spawn(scheduler.run());
    let bot_handle = tokio::spawn(bot.run());

    let finished_early = tokio::select! {
        received = wait_for_signal() => {
            if let Err(e) = received {
                warn!(error = %e, "Failed to listen for shutdown signals");
            }
            info!("Received shutdown signal");
            None
        }
        joined = &mut scheduler_handle => Some(joined),
    };

    trigger.trigger();

    if let Some(joined) = finished_early {
        let _ = tokio::time::timeout(config.shutdown_grace, bot_handle).await;
        return match joined {
            Ok(Ok(outcome)) => {
                log_outcome(&outcome);
                Ok(ExitCode::SUCCESS)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow!("scheduler task panicked: {e}")),
        };
    }

    info!(grace_secs = config.shutdown_grace.as_secs(), "Waiting for loops to stop");
    let stopped = tokio::time::timeout(config.shutdown_grace, async {
        (scheduler_handle.await, bot_handle.await)
    })
    .await;

    match stopped {
        Ok((scheduler, bot)) => {
            match scheduler {
                Ok(Ok(outcome)) => log_outcome(&outcome),
                Ok(Err(e)) => error!(error = %e, "Scheduler stopped with error"),
                Err(e) => error!(error = %e, "Scheduler task panicked"),
            }
            match bot {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Bot loop stopped with error"),
                Err(e) => error!(error = %e, "Bot task panicked"),
            }
            info!("slotwatch shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => {
            error!("Loops did not stop within the grace period, forcing exit");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn log_outcome(outcome: &LoopOutcome) {
    let LoopOutcome::Stopped {
        cycle_count,
        last_success,
    } = outcome;
    info!(cycle_count, last_success = ?last_success, "Scheduler stopped");
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
