//! Demo binary: wire the control plane and dispatch a loopback command

use std::sync::Arc;

use fleettower::telemetry::{self, TelemetryBus};
use fleettower::{
    AuditLog, CommandRequest, CommandRouter, ConnectionMatrix, ControlPlaneConfig, Device,
    LoopbackConnector, PolicyContext, PolicyEngine,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ControlPlaneConfig::default();
    info!("Control plane starting");
    info!("  audit log: {}", config.audit_log_path().display());

    let bus = TelemetryBus::new();
    let audit = Arc::new(AuditLog::open(config.audit_log_path(), bus.clone()).await?);
    audit.bootstrap().await?;
    let policy = Arc::new(PolicyEngine::new(bus.clone()));
    let matrix = Arc::new(ConnectionMatrix::new(bus.clone(), audit.clone()));
    let router = CommandRouter::new(
        matrix.clone(),
        policy.clone(),
        audit.clone(),
        bus.clone(),
        config.router.clone(),
    );

    // Mirror every bus event into the log output.
    bus.subscribe(
        "*",
        telemetry::handler(|event| async move {
            info!(topic = %event.topic, "{}", event.payload);
        }),
    );

    matrix
        .register_device(
            Device::new("dev1", "loopback:dev1"),
            Some(Arc::new(LoopbackConnector)),
        )
        .await?;

    let request = CommandRequest::new("ping", vec!["dev1".into()]);
    let context = PolicyContext::from_request(&request);
    let results = router.dispatch(&request, &context, None).await?;
    for result in &results {
        info!(
            device_id = %result.device_id,
            status = ?result.status,
            "result: {}",
            result.stdout
        );
    }

    info!("audit chain valid: {}", audit.verify().await?);
    for record in audit.tail(5).await? {
        info!("audit {} {}", record.kind, record.payload);
    }

    // Let the bus drain its queue before the process exits.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}
