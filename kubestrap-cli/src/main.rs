// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-line interface for the cluster bootstrap orchestrator.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use slog::{info, o, warn, Drain, Logger};
use tokio_util::sync::CancellationToken;

use kubestrap_core::config::Config;
use kubestrap_core::exec::SshRunner;
use kubestrap_core::rollout::{RolloutEngine, RolloutTunables};

/// Bootstraps an offline RKE2 cluster across a fleet of SSH-reachable
/// hosts.
#[derive(Debug, Parser)]
#[command(name = "kubestrap", version)]
struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the full phased rollout against the configured fleet.
    Install {
        /// Path to the cluster config file.
        #[clap(long)]
        config: Utf8PathBuf,
    },
    /// Probes every host and reports its state without changing anything.
    Status {
        /// Path to the cluster config file.
        #[clap(long)]
        config: Utf8PathBuf,
    },
}

fn setup_log() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = {
        let mut builder = slog_envlogger::LogBuilder::new(drain);
        if let Ok(s) = std::env::var("RUST_LOG") {
            builder = builder.parse(&s);
        } else {
            // Log at the info level by default.
            builder = builder.filter(None, slog::FilterLevel::Info);
        }
        builder.build()
    };
    let drain = slog_async::Async::new(drain.fuse()).build().fuse();
    Logger::root(drain, o!())
}

fn load_config(log: &Logger, path: &Utf8PathBuf) -> Result<Config> {
    let config = Config::from_file(path)?;
    config.validate().context("invalid configuration")?;
    info!(log, "loaded {} hosts from {path}", config.hosts.len());
    Ok(config)
}

async fn install(log: &Logger, path: &Utf8PathBuf) -> Result<()> {
    let config = load_config(log, path)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let log = log.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(
                    log,
                    "interrupt received; stopping before the next remote \
                     operation (re-run to resume)"
                );
                cancel.cancel();
            }
        });
    }

    let runner = SshRunner::new(log);
    let engine = RolloutEngine::new(
        &config,
        &runner,
        RolloutTunables::default(),
        cancel,
        log,
    )?;
    let report = engine.run().await?;

    for host in &report.status.hosts {
        info!(log, "node {}: {}", host.name, host.state);
    }
    if report.converged {
        info!(log, "cluster is up; all nodes ready");
    } else {
        warn!(
            log,
            "completed with warnings; not yet ready: {} (re-run `kubestrap \
             status` later)",
            report.not_ready.join(", ")
        );
    }
    info!(
        log,
        "cluster credentials: {}:{}; join token: {}:{}",
        report.handoff.seed_address,
        report.handoff.kubeconfig,
        report.handoff.seed_address,
        report.handoff.join_token
    );
    if config.database_enabled(log) {
        info!(
            log,
            "database deployment is enabled; the database installer can \
             now run against this cluster"
        );
    }
    Ok(())
}

async fn status(log: &Logger, path: &Utf8PathBuf) -> Result<()> {
    let config = load_config(log, path)?;
    let runner = SshRunner::new(log);
    let engine = RolloutEngine::new(
        &config,
        &runner,
        RolloutTunables::default(),
        CancellationToken::new(),
        log,
    )?;
    let status = engine.status().await?;
    for host in &status.hosts {
        info!(log, "node {}: {}", host.name, host.state);
    }
    info!(log, "{}", status.summary());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::parse();
    let log = setup_log();
    match &app.command {
        Command::Install { config } => install(&log, config).await,
        Command::Status { config } => status(&log, config).await,
    }
}
