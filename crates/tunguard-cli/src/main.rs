use std::fs;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunguard_engine::{Engine, EngineConfig, EngineHandle, StaticPolicy};

mod config;
mod policy_file;

use config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config = args.apply(EngineConfig::from_env().context("invalid TUNGUARD_* environment")?);
    let policy = match &args.policy {
        Some(path) => policy_file::load(path)?,
        None => StaticPolicy::default(),
    };

    anyhow::ensure!(args.tun_fd >= 0, "invalid tun descriptor {}", args.tun_fd);
    // SAFETY: the descriptor was handed to us by the parent and nothing else in this process
    // owns it.
    let tun = unsafe { OwnedFd::from_raw_fd(args.tun_fd) };
    let mut engine = Engine::new(config, Arc::new(policy), tun).context("failed to start engine")?;
    let handle = engine.handle();
    info!(tun_fd = args.tun_fd, mtu = engine.mtu(), "tunguard running");

    let mut runner = tokio::task::spawn_blocking(move || engine.run());
    let mut terminate = signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            result = &mut runner => {
                report(&handle, args.metrics_file.as_deref());
                return result
                    .context("engine thread panicked")?
                    .context("engine stopped");
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to watch SIGINT")?;
                info!("interrupted");
                break;
            }
            _ = terminate.recv() => {
                info!("terminated");
                break;
            }
            _ = ticker.tick(), if args.stats_interval > 0 => {
                report(&handle, args.metrics_file.as_deref());
            }
        }
    }

    handle.stop();
    runner
        .await
        .context("engine thread panicked")?
        .context("engine stopped")?;
    report(&handle, args.metrics_file.as_deref());
    Ok(())
}

fn report(handle: &EngineHandle, metrics_file: Option<&Path>) {
    let stats = handle.stats();
    let metrics = handle.metrics();
    info!(
        icmp = stats.icmp,
        udp = stats.udp,
        tcp = stats.tcp,
        open_fds = ?stats.open_fds,
        fd_limit = ?stats.fd_limit,
        packets_rx = metrics.packets_rx_total,
        packets_tx = metrics.packets_tx_total,
        denied = metrics.policy_denied_total,
        dns_blocked = metrics.dns_blocked_total,
        "stats"
    );

    if let Some(path) = metrics_file {
        if let Err(err) = write_replacing(path, &handle.render_prometheus()) {
            warn!(path = %path.display(), "failed to write metrics: {err:#}");
        }
    }
}

/// Write next to `path` and rename over it, so scrapers never see a partial file.
fn write_replacing(path: &Path, contents: &str) -> anyhow::Result<()> {
    let staging = path.with_extension("tmp");
    fs::write(&staging, contents)
        .with_context(|| format!("failed to write {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("failed to replace {}", path.display()))
}
