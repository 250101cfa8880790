use clap::Parser;
use classgate::controller::{
    run_watcher, EventForwarder, FaultReporter, FileDataPlane, Reconciler, ReconcilerHandle,
};
use classgate::server::{
    create_metrics, run_health_server, shutdown_channel, ReadinessState, ServerState,
};
use classgate::Args;
use kube::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Flip readiness once the data plane has accepted a configuration
pub async fn mark_ready_on_first_apply(handle: ReconcilerHandle, readiness: ReadinessState) {
    let mut applied = handle.watch_applied();
    match applied.wait_for(Option::is_some).await {
        Ok(_) => {
            readiness.set_ready();
            info!("First configuration applied, controller ready");
        }
        Err(_) => warn!("Reconciler stopped before applying any configuration"),
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    args.validate()?;
    let identity = args.identity();

    info!(
        class = identity.class().unwrap_or("<default>"),
        owns_unclassed = identity.owns_unclassed(),
        config_path = %args.config_path.display(),
        "Starting classgate ingress controller"
    );

    let metrics = create_metrics()?;
    let faults = FaultReporter::new(Some(metrics.clone()));

    let data_plane = Arc::new(FileDataPlane::new(&args.config_path, args.reload_url.clone()));
    let reconciler = Reconciler::new(identity, data_plane, args.reconciler_config())
        .with_faults(faults.clone())
        .with_metrics(metrics.clone());
    let handle = reconciler.handle();

    // Readiness follows the first successful apply
    let readiness = ReadinessState::new();
    tokio::spawn(mark_ready_on_first_apply(handle.clone(), readiness.clone()));

    let server_state = ServerState {
        readiness,
        metrics,
        reconciler: Some(handle),
    };
    let health_port = args.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, server_state).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    // Create Kubernetes client
    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let (tx, rx) = mpsc::channel(args.event_queue_capacity);
    let (shutdown, signal) = shutdown_channel();

    let forwarder = EventForwarder::new(tx, faults);
    let mut watcher_task = tokio::spawn(run_watcher(
        client,
        args.namespace(),
        forwarder,
        signal.clone(),
    ));
    let mut reconciler_task = tokio::spawn(reconciler.run(rx, signal));

    let (mut watcher_done, mut reconciler_done) = (false, false);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for interrupt");
            }
            info!("Interrupt received, shutting down");
        }
        result = &mut watcher_task => {
            watcher_done = true;
            match result {
                Ok(Ok(())) => info!("Watcher stopped"),
                Ok(Err(e)) => error!(error = %e, "Watcher failed"),
                Err(e) => error!(error = %e, "Watcher task panicked"),
            }
        }
        _ = &mut reconciler_task => {
            reconciler_done = true;
            warn!("Reconciler stopped unexpectedly");
        }
    }

    shutdown.trigger();
    if !watcher_done {
        if let Ok(Err(e)) = watcher_task.await {
            warn!(error = %e, "Watcher exited with error during shutdown");
        }
    }
    if !reconciler_done {
        if let Err(e) = reconciler_task.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
