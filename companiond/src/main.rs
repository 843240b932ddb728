// Copyright (c) The companiond Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The companion daemon entrypoint.

mod config;
mod dispatch;

use camino::Utf8PathBuf;
use companion_metadata::CompanionExitCode;
use companion_runner::{
    executor::CommandExecutor,
    storage::{NoopCodesigner, StorageManager},
    target::{Target, TargetState, loopback::LoopbackAdapter},
    workspace::TemporaryWorkspace,
};
use config::{Args, CompanionConfig};
use std::{process::ExitCode, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = <Args as clap::Parser>::parse();
    let config = CompanionConfig::from(&args);

    if let Err(error) = init_logging(&args) {
        eprintln!("companiond: could not initialize logging: {error}");
        return ExitCode::from(CompanionExitCode::INIT_FAILED as u8);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "could not start the runtime");
            return ExitCode::from(CompanionExitCode::INIT_FAILED as u8);
        }
    };
    let code = runtime.block_on(run(config));
    ExitCode::from(code as u8)
}

fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(&args.log_filter)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("log file clone"))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn run(config: CompanionConfig) -> i32 {
    // Bring up the platform adapter. The loopback backend is the only one
    // the daemon ships with; simulators and devices are provided by a
    // platform adapter at deployment time.
    let Some(loopback_root) = config.loopback_root.clone() else {
        tracing::error!(
            "no platform adapter configured; pass --loopback-root to run against \
             a loopback target"
        );
        return CompanionExitCode::INIT_FAILED;
    };
    let adapter = Arc::new(LoopbackAdapter::new(loopback_root));
    let target_archs = adapter.architectures();
    let target = Target::new(adapter, TargetState::Booted);

    let storage = match StorageManager::new(
        config.storage_root.clone(),
        target_archs,
        Arc::new(NoopCodesigner),
    ) {
        Ok(storage) => storage,
        Err(error) => {
            tracing::error!(%error, root = %config.storage_root, "storage root is unusable");
            return CompanionExitCode::INIT_FAILED;
        }
    };
    let workspace = match TemporaryWorkspace::new(config.temp_root.clone()) {
        Ok(workspace) => workspace,
        Err(error) => {
            tracing::error!(%error, root = %config.temp_root, "temp root is unusable");
            return CompanionExitCode::INIT_FAILED;
        }
    };

    let executor = CommandExecutor::new(
        target,
        storage,
        workspace,
        config.log_file.as_ref().map(Utf8PathBuf::clone),
        config.debugserver_port,
    );
    let dispatcher = dispatch::Dispatcher::new(executor);

    let listener = match TcpListener::bind(("127.0.0.1", config.port)).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, port = config.port, "could not bind the listen socket");
            return CompanionExitCode::BIND_FAILED;
        }
    };
    tracing::info!(port = config.port, "companiond is serving");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.serve_connection(stream).await;
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            },
            _ = shutdown_signal() => {
                tracing::info!("shutting down");
                return CompanionExitCode::OK;
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler installs");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
