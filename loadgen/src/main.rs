use chatload::{Config, LoadRun, StopHandle};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// First Ctrl-C drains the run, the second aborts in-flight calls
fn spawn_signal_handler(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, draining virtual users (press Ctrl-C again to abort)");
        stop.drain();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, aborting in-flight calls");
            stop.abort();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = Config::from_env()?;
    let scenario = match &config.scenario.file {
        Some(path) => path.display().to_string(),
        None => config.scenario.name.clone(),
    };
    info!(
        "Loaded configuration: base_url={}, scenario={}, identities={}, streams={}",
        config.target.base_url,
        scenario,
        config.identities.count,
        config.streams.count
    );

    // Validate before anything touches the network
    let run = LoadRun::new(config)?;

    if let Some(addr) = run.config().output.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics listening on http://{}/metrics", addr);
    }

    let summary_path = run.config().output.summary_path.clone();
    let (stop, listener) = StopHandle::new();
    spawn_signal_handler(stop);

    let summary = run.execute(listener).await?;

    let json = summary.to_json()?;
    println!("{json}");
    if let Some(path) = summary_path {
        summary.write_to(&path)?;
        info!("Summary written to {}", path.display());
    }

    Ok(())
}
