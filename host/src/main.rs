use std::path::Path;

use anyhow::Context;
use dashbench_host::adapter::AdapterRegistry;
use dashbench_host::allocator::AddressAllocator;
use dashbench_host::analysis::{
    AnalysisDescriptor, AnalysisIndex, AnalysisRegistry, KernelKind, INDEX_FILE,
};
use dashbench_host::bus::{BusPublisher, MessageBus};
use dashbench_host::hub::Hub;
use dashbench_host::infrastructure::config::{BusSettings, Settings};
use dashbench_host::infrastructure::server::{self, AppState, IndexPage};
use dashbench_host::infrastructure::{audit, telemetry::TelemetryBuilder};
use dashbench_host::kernel::{CommandBuilder, KernelSupervisor};
use futures_util::future::join_all;
use std::net::{IpAddr, Ipv4Addr};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Settings::new().context("Failed to load configuration")?;

    let telemetry = TelemetryBuilder::from_settings(&config.telemetry, env!("CARGO_PKG_VERSION"))
        .with_metrics()
        .init()
        .context("Failed to initialize telemetry")?;

    info!("Dashbench starting...");
    audit::log_audit(&audit::AuditEvent::SystemStartup {
        component: "host".into(),
    });

    let analyses = AnalysisRegistry::packaged();
    let index = load_index(&config.analyses.path, &analyses)?;

    let port = bus_port(&config.bus).context("No address available for the kernel bus")?;
    let mut bus = MessageBus::bind(port)
        .await
        .context("Failed to bind the kernel bus")?;
    info!(address = %bus.address(), "kernel bus listening");

    let mut supervisor = KernelSupervisor::with_tokio(config.supervisor.grace_period());
    launch_kernels(&config, &index, &bus.publisher(), &mut supervisor).await;

    let adapters = AdapterRegistry::from_descriptors(&index.analyses, &analyses, &bus.publisher());
    let hub = Hub::new(adapters).with_cli_args(std::env::args().skip(1).collect());
    let (hub_handle, hub_task) = hub.spawn(bus.take_inbound());

    let page = IndexPage::from_index(&index);
    let extra_routes = analyses
        .all_routes()
        .into_iter()
        .filter(|(name, _)| page.contains(name))
        .collect();
    let state = AppState::new(hub_handle, page, supervisor.status_board(), telemetry.metrics());
    let app = server::build_router(state, extra_routes);

    info!("Dashbench initialized. Waiting for shutdown signal...");
    if let Err(e) = server::run_server(&config.server, app, shutdown_signal()).await {
        error!("Dashboard server failed: {:?}", e);
    }

    info!("Shutdown signal received, cleaning up...");
    audit::log_audit(&audit::AuditEvent::SystemShutdown {
        reason: "Signal received".into(),
    });

    bus.shutdown();
    supervisor.stop_all().await;
    hub_task.abort();

    info!("Dashbench Shutdown Complete.");
    telemetry.shutdown();
    Ok(())
}

/// Loads `index.yaml`, or serves the packaged analyses when there is none.
fn load_index(root: &Path, analyses: &AnalysisRegistry) -> anyhow::Result<AnalysisIndex> {
    if root.join(INDEX_FILE).is_file() {
        return AnalysisIndex::load(root)
            .with_context(|| format!("Failed to load analyses from {}", root.display()));
    }
    warn!(path = %root.display(), "no analysis index found, serving packaged analyses");
    let mut names = analyses.names();
    names.sort_unstable();
    Ok(AnalysisIndex {
        title: Some("Dashbench".into()),
        analyses: names
            .into_iter()
            .map(|name| AnalysisDescriptor::new(name, KernelKind::None))
            .collect(),
        ..AnalysisIndex::default()
    })
}

fn bus_port(settings: &BusSettings) -> anyhow::Result<u16> {
    let mut allocator = AddressAllocator::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        settings.port_min..=settings.port_max,
    );
    let port = match settings.port {
        Some(port) => allocator.reserve(port)?,
        None => allocator.allocate()?,
    };
    Ok(port)
}

/// Builds and starts every external kernel, then waits for their bus
/// handshakes. Failures make one analysis unavailable; the host keeps going.
async fn launch_kernels(
    config: &Settings,
    index: &AnalysisIndex,
    publisher: &BusPublisher,
    supervisor: &mut KernelSupervisor,
) {
    let builder = CommandBuilder::new(&config.kernels);
    let address = publisher.address();
    let mut started = Vec::new();

    for descriptor in index.analyses.iter().filter(|d| d.kernel.is_external()) {
        let name = descriptor.name.clone();
        let built = {
            let (builder, descriptor) = (builder.clone(), descriptor.clone());
            tokio::task::spawn_blocking(move || builder.build(&descriptor, address)).await
        };
        let command = match built {
            Ok(Ok(Some(command))) => command,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                mark_unavailable(&name, &e.to_string());
                continue;
            }
            Err(e) => {
                mark_unavailable(&name, &format!("build task failed: {e}"));
                continue;
            }
        };
        match supervisor.start(&name, command, address) {
            Ok(()) => started.push(name),
            Err(e) => mark_unavailable(&name, &e.to_string()),
        }
    }

    let timeout = config.supervisor.startup_timeout();
    let handshakes = started
        .iter()
        .map(|name| async move { (name, publisher.wait_for_subscriber(name, timeout).await) });
    for (name, result) in join_all(handshakes).await {
        match result {
            Ok(()) => info!(analysis = %name, "kernel ready"),
            Err(e) => mark_unavailable(name, &e.to_string()),
        }
    }
}

fn mark_unavailable(analysis: &str, reason: &str) {
    error!(analysis, reason, "analysis unavailable");
    metrics::counter!("dashbench_analysis_unavailable_total").increment(1);
    audit::log_audit(&audit::AuditEvent::AnalysisUnavailable {
        analysis: analysis.to_string(),
        reason: reason.to_string(),
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
