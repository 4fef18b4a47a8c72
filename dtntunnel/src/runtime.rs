use anyhow::{Context, Result};
use dtntunnel_core::control::TunnelConfig;
use dtntunnel_core::coordinator::{Coordinator, TransportHandles};
use dtntunnel_core::eid_table::{DestinationResolver, DestinationTable};
use dtntunnel_core::transport::udp::UdpTransport;
use dtntunnel_core::transport::{BundleTransport, EndpointId};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Run a tunnel over the UDP bundle transport until stopped
pub async fn run(cfg: TunnelConfig, stop: watch::Receiver<bool>) -> Result<()> {
    cfg.validate().context("invalid configuration")?;
    let transport = UdpTransport::bind(cfg.transport_bind)
        .await
        .with_context(|| format!("failed to bind bundle transport to {}", cfg.transport_bind))?;
    info!("Bundle transport bound: {}", transport.local_addr());
    run_tunnel(cfg, Arc::new(transport), stop).await
}

/// Run a tunnel over `transport`.
///
/// Returns when `stop` flips to true, on Ctrl-C, or with an error when the
/// transport can no longer receive.
pub async fn run_tunnel(
    cfg: TunnelConfig,
    transport: Arc<dyn BundleTransport>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    cfg.validate().context("invalid configuration")?;
    let resolver = destination_resolver(&cfg)?;

    let local_eid = match &cfg.local_eid {
        Some(eid) => EndpointId::parse(eid).context("invalid local endpoint id")?,
        None => transport.build_local_eid(&cfg.registration_service()),
    };
    transport
        .register(&local_eid)
        .await
        .with_context(|| format!("failed to register {local_eid}"))?;
    info!(
        "Config: local_eid={local_eid} protocol={} listen={} tunnel={} max_size={} delay={:?}",
        cfg.protocol,
        cfg.listen,
        cfg.tunnel.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
        cfg.max_size,
        cfg.delay
    );

    let coord = Coordinator::new(&cfg, local_eid, resolver, TransportHandles::shared(transport));

    if let Some(interval) = cfg.stats_interval {
        coord.spawn_reporter(interval);
    }

    let listener = match cfg.tunnel {
        Some(spec) if !cfg.listen => {
            let task = coord
                .start_listener(spec)
                .with_context(|| format!("failed to start {} listener", cfg.protocol))?;
            info!("Forwarding {} to {}", task.local_addr, spec.remote);
            Some(task)
        }
        _ => None,
    };

    let receiver = coord.clone();
    let mut receive_loop = tokio::spawn(async move { receiver.run_receive_loop().await });

    let result = tokio::select! {
        _ = wait_for_stop(&mut stop) => {
            info!("Stop requested");
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
        joined = &mut receive_loop => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("bundle receive failed")),
            Err(e) => Err(anyhow::Error::new(e).context("receive loop task failed")),
        },
    };

    coord.shutdown();
    if let Some(task) = listener {
        let _ = task.handle.await;
    }
    info!("Tunnel stopped");
    result
}

fn destination_resolver(cfg: &TunnelConfig) -> Result<DestinationResolver> {
    if let Some(path) = &cfg.dest_eid_table {
        let table = DestinationTable::load(path)?;
        info!(
            "Loaded {} destination entries from {}",
            table.len(),
            path.display()
        );
        return Ok(DestinationResolver::table(table));
    }
    match &cfg.dest_eid {
        Some(eid) => Ok(DestinationResolver::fixed(
            EndpointId::parse(eid).context("invalid destination endpoint id")?,
        )),
        None => Ok(DestinationResolver::default()),
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            // Nobody can ask us to stop any more
            std::future::pending::<()>().await;
        }
    }
}
