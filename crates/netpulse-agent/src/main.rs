// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::env;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use netpulse::config::{Config, DEFAULT_LOG_LEVEL, ENV_LOG_LEVEL};
use netpulse::errors::RuntimeError;
use netpulse::runtime::Runtime;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var(ENV_LOG_LEVEL)
        .map(|val| val.trim().to_lowercase())
        .ok()
        .filter(|val| !val.is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    if let Err(e) = init_logging(&log_level) {
        eprintln!("netpulse-agent: {e:#}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("rumqttc=warn,redis=warn,hyper=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter)
                .with_context(|| format!("invalid {ENV_LOG_LEVEL} {log_level:?}"))?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

async fn run() -> anyhow::Result<()> {
    let config = Config::new().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let runtime = Runtime::new(config).await?;
    match runtime.run(cancel).await {
        Ok(()) => Ok(()),
        Err(RuntimeError::ShutdownTimeout(grace)) => {
            warn!("Shutdown grace period of {grace:?} exceeded, exiting anyway");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, shutting down");
        }
        cancel.cancel();
    });
    Ok(())
}
