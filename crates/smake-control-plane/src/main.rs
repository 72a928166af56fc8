use smake_control_plane::config::SmakeConfig;
use smake_control_plane::ControlPlane;
use smake_providers::SimulatedCloud;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SmakeConfig::from_env()?;
    info!(
        default_ami = %config.default_ami,
        default_type = %config.default_type,
        pool_shape = ?config.pool_shape,
        "Starting smake control plane"
    );

    // Only the simulated cloud is wired in; a real provider client
    // implements the same two traits.
    let control_plane = ControlPlane::new(&config, SimulatedCloud::new())?;

    let report = control_plane.pool.initialize().await?;
    info!(report = %serde_json::to_string(&report)?, "Initial pool reconciliation issued");
    for failure in &report.failures {
        warn!(
            instance_type = %failure.instance_type,
            action = %failure.action,
            error = %failure.error,
            "Pool reconciliation step failed"
        );
    }

    let snapshot = control_plane.pool.pool_snapshot().await?;
    info!(members = snapshot.total(), types = ?snapshot.types().collect::<Vec<_>>(), "Pool ready");

    tokio::signal::ctrl_c().await?;

    info!(metrics = %control_plane.metrics.render_metrics()?, "Shutting down");
    Ok(())
}
