use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use snapshot_agent::{
    default_registry, session_connector, AgentConfig, ContextGauge, Fleet, FleetCollaborators,
    HttpControlPlane, PipelineRunner,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Capture periodic RTSP camera snapshots and upload them to the control plane"
)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "SNAPSHOT_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Decoder backend (overrides config). `synthetic` emits test patterns.
    #[arg(long)]
    decoder: Option<String>,

    /// Run a single cycle, drain, and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = AgentConfig::load_with_decoder(args.config.as_deref(), args.decoder.as_deref())?;

    let registry = default_registry(cfg.decoder.width, cfg.decoder.height);
    let backend = registry.get(&cfg.decoder.backend).ok_or_else(|| {
        anyhow!(
            "decoder backend '{}' unavailable; registered: {}",
            cfg.decoder.backend,
            registry.list().join(", ")
        )
    })?;
    if backend.name() == "synthetic" {
        log::warn!("synthetic decoder selected: uploads are flat test patterns, not camera pictures");
    }
    let connector = session_connector(&cfg.rtsp_client, cfg.rtsp.clone())?;
    log::info!(
        "snapshotd {} starting (rtsp={}, decoder={}, encoder={:?}, heartbeat={:?})",
        env!("CARGO_PKG_VERSION"),
        connector.name(),
        backend.name(),
        cfg.decoder.encoder,
        cfg.heartbeat_interval
    );

    let gauge = ContextGauge::new();
    let runner = PipelineRunner::new(backend, cfg.decoder.encoder, cfg.rtsp.clone())
        .with_connector(connector)
        .with_gauge(gauge.clone());
    let plane = Arc::new(HttpControlPlane::new(
        cfg.credentials.clone(),
        cfg.endpoints.clone(),
        cfg.http_timeout,
    ));
    let fleet = Fleet::new(
        FleetCollaborators {
            auth: plane.clone(),
            roster: plane.clone(),
            sink: plane.clone(),
            heartbeat: plane,
        },
        Arc::new(runner),
        cfg.heartbeat_interval,
    );

    let (tx, rx) = crossbeam_channel::unbounded();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    if args.once {
        let (report, end) = fleet.run_cycle(&rx);
        log::info!(
            "cycle finished ({:?}): healthy={} cameras={} skipped={}",
            end,
            report.healthy,
            report.cameras,
            report.skipped
        );
    } else {
        let reports = fleet.run(&rx);
        log::info!("ran {} cycles", reports.len());
    }

    log::info!(
        "decode contexts: opened={} closed={} live={} peak={}",
        gauge.opened(),
        gauge.closed(),
        gauge.live(),
        gauge.peak()
    );
    if gauge.live() != 0 {
        return Err(anyhow!("{} decode contexts leaked", gauge.live()));
    }
    Ok(())
}
