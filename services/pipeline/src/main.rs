//! IMU Pipeline service
//!
//! Receives sensor frames over UDP and runs them through calibration, the
//! chart feed, the partitioned CSV log and the batch uploader.

use anyhow::{Context, Result};
use imu_pipeline::prelude::*;
use imu_pipeline::{config::ServiceConfig, UdpFrameSource};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = PipelineConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_logging(&config.service);

    info!(
        service = %config.service.name,
        device_id = %config.upload.device_id,
        "Starting IMU pipeline"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let profiles = Arc::new(JsonFileStore::new(&config.calibration.store_dir));
    let documents = Arc::new(
        S3DocumentStore::new(&config.upload.s3)
            .await
            .context("Failed to initialize S3 document store")?,
    );
    if let Err(e) = documents.check_bucket().await {
        warn!(error = %e, "Upload bucket check failed, uploads may fail");
    }
    info!(
        bucket = documents.bucket(),
        profile_dir = %profiles.dir().display(),
        "Stores initialized"
    );

    let pipeline = Arc::new(Pipeline::new(
        &config,
        profiles,
        documents,
        Arc::new(SystemClock),
    ));
    pipeline.start();
    info!(
        log_dir = %pipeline.log_writer().directory().display(),
        "Pipeline initialized"
    );

    let events_handle = tokio::spawn(log_calibration_events(pipeline.calibration().subscribe()));

    if config.calibration.run_on_start {
        info!("Starting calibration, keep the sensor still and level");
        pipeline.calibration().start();
    }

    if config.recording.start_on_launch {
        if let Err(e) = pipeline.set_recording(true).await {
            error!(error = %e, "Failed to start recording");
        }
    }

    // Spawn the frame transport
    let source = UdpFrameSource::bind(&config.transport.bind_addr)
        .await
        .context("Failed to bind frame transport")?;
    let shutdown = CancellationToken::new();
    let mut transport_handle = tokio::spawn({
        let pipeline = pipeline.clone();
        let shutdown = shutdown.clone();
        async move { source.run(pipeline, shutdown).await }
    });

    // Spawn the stats monitor
    let monitor_handle = tokio::spawn(run_stats_monitor(
        pipeline.clone(),
        config.service.stats_interval(),
    ));

    info!("IMU pipeline started successfully");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut transport_handle => {
            match result {
                Ok(Ok(_)) => warn!("Frame transport exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "Frame transport failed"),
                Err(e) => error!(error = %e, "Frame transport task panicked"),
            }
        }
    }

    shutdown.cancel();
    if !transport_handle.is_finished() {
        let _ = transport_handle.await;
    }
    monitor_handle.abort();

    // Final log flush and upload attempt
    pipeline.shutdown().await;
    events_handle.abort();

    log_final_stats(&pipeline);

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_format == "pretty" {
        registry
            .with(fmt::layer().pretty().with_target(false))
            .init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Log calibration progress and results. Returns the number of events
/// seen once the engine is gone.
async fn log_calibration_events(mut events: broadcast::Receiver<CalibrationEvent>) -> u64 {
    let mut seen = 0u64;
    loop {
        let event = events.recv().await;
        if event.is_ok() {
            seen += 1;
        }
        match event {
            Ok(CalibrationEvent::Started { required }) => {
                info!(required, "Calibration collecting");
            }
            Ok(CalibrationEvent::Progress { count, required }) => {
                info!(count, required, "Calibration progress");
            }
            Ok(CalibrationEvent::Completed(profile)) => {
                info!(calibrated_at = profile.calibrated_at, "Calibration saved");
            }
            Ok(CalibrationEvent::Failed(e)) => {
                warn!(error = %e, "Calibration failed");
            }
            Ok(CalibrationEvent::Cancelled) => {
                info!("Calibration cancelled");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Calibration event subscriber lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    seen
}

/// Run the stats monitoring loop.
async fn run_stats_monitor(pipeline: Arc<Pipeline>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let stats = pipeline.stats();
        info!(
            frames_received = stats.frames_received,
            rejected_format = stats.rejected_format,
            rejected_range = stats.rejected_range,
            samples_routed = stats.samples_routed,
            recording = pipeline.is_recording(),
            "Pipeline stats"
        );

        if pipeline.is_recording() {
            let log = pipeline.log_writer().stats();
            let upload = pipeline.uploader().stats();
            info!(
                written = log.written,
                failed = log.failed,
                pending = log.pending,
                file = ?pipeline.log_writer().current_file_path(),
                "Log writer stats"
            );
            info!(
                uploaded = upload.uploaded,
                failed = upload.failed,
                pending = upload.pending,
                batches = upload.batches,
                "Uploader stats"
            );
        }
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(pipeline: &Pipeline) {
    info!("=== Final Statistics ===");

    let stats = pipeline.stats();
    info!(
        frames_received = stats.frames_received,
        rejected_format = stats.rejected_format,
        rejected_range = stats.rejected_range,
        samples_routed = stats.samples_routed,
        calibration_samples = stats.calibration_samples,
        "Pipeline final stats"
    );

    let log = pipeline.log_writer().stats();
    info!(
        written = log.written,
        failed = log.failed,
        pending = log.pending,
        "Log writer final stats"
    );

    let upload = pipeline.uploader().stats();
    info!(
        uploaded = upload.uploaded,
        failed = upload.failed,
        batches = upload.batches,
        session_id = ?pipeline.uploader().session_id(),
        "Uploader final stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use imu_pipeline::config::CalibrationConfig;
    use imu_pipeline::{CalibrationEngine, ManualClock, MemoryStore};

    #[tokio::test]
    async fn test_start_event_logged_when_calibrating_on_launch() {
        let engine = CalibrationEngine::new(
            &CalibrationConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
        );

        let handle = tokio::spawn(log_calibration_events(engine.subscribe()));
        // Starts before the logging task has been polled
        engine.start();
        engine.cancel();
        drop(engine);

        assert_eq!(handle.await.unwrap(), 2);
    }
}
