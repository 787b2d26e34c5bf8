use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netlog::{
    capture::DatalinkSource,
    cli::Cli,
    config::Config,
    export::{RecordFeeder, StdoutSink},
    filter::{AllowAll, FilterPredicate, RuleSet},
    inventory,
    listen::ListeningPortRegistry,
    recorder::{FlowRecorder, RecorderConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string())),
        )
        .init();

    let config = Config::load(&cli).context("loading configuration")?;
    let netns: Arc<str> = Arc::from(config.netns.as_str());

    // A broken filter rule must not stop capture; run unfiltered instead.
    if let Err(e) = RuleSet::compile(&config.filter) {
        warn!(
            event.name = "filter.disabled",
            error = %e,
            "invalid filter rule, capturing unfiltered"
        );
    }

    let listen = Arc::new(ListeningPortRegistry::new());
    if let Err(e) = listen.refresh() {
        warn!(event.name = "listen.initial_scan_failed", error = %e);
    }

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    for name in &config.interfaces {
        let Some(iface) = inventory::resolve(name) else {
            let available: Vec<String> = inventory::interfaces(&netns)
                .into_iter()
                .map(|nic| nic.name)
                .collect();
            error!(
                event.name = "capture.interface_missing",
                interface = %name,
                available = ?available,
            );
            continue;
        };
        let source = match DatalinkSource::open(&iface) {
            Ok(source) => source,
            Err(e) => {
                error!(
                    event.name = "capture.open_failed",
                    interface = %name,
                    error = %e,
                );
                continue;
            }
        };

        let nic_mac = iface
            .mac
            .map(|m| [m.0, m.1, m.2, m.3, m.4, m.5])
            .unwrap_or_default();
        let recorder = Arc::new(FlowRecorder::new(
            RecorderConfig {
                interface: name.clone(),
                nic_mac,
                netns: Arc::clone(&netns),
                sweep_interval: config.sweep_interval(),
                flush_interval: config.flush_interval(),
                timeouts: config.timeouts(),
                port_floor: config.port_wildcard_floor,
                emit_tcp_records: config.emit_tcp_records,
                emit_metrics: config.emit_metrics,
                enable_grpc: config.enable_grpc,
                chunk_packet_cap: config.chunk_packet_cap,
            },
            RecordFeeder::new(Box::new(StdoutSink)),
            compile_filter(&config.filter),
            Arc::clone(&listen),
            cancel.clone(),
        ));

        info!(
            event.name = "capture.started",
            interface = %name,
            mac = %netlog_types::fmt_mac(&nic_mac),
        );
        tasks.push(tokio::spawn(
            Arc::clone(&recorder).run_capture(Box::new(source)),
        ));
        tasks.push(tokio::spawn(recorder.run_gather()));
    }

    if tasks.is_empty() {
        anyhow::bail!("no capture interface could be opened");
    }

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!(event.name = "shutdown.begin");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!(event.name = "shutdown.complete");
    Ok(())
}

fn compile_filter(conf: &netlog::filter::FilterConf) -> Box<dyn FilterPredicate> {
    match RuleSet::compile(conf) {
        Ok(rules) => Box::new(rules),
        Err(_) => Box::new(AllowAll),
    }
}
