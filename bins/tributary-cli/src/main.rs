use anyhow::Result;
use clap::Parser;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tributary_core::context::StreamContext;
use tributary_core::status::{StreamStatusReporter, TracingStatusReporter};
use tributary_core::PipelineSpec;
use tributary_tx::DEFAULT_CHANNEL_CAPACITY;

mod runner;

#[derive(Parser, Debug)]
#[command(name = "tributary", about = "Run one tributary stream")]
struct Args {
    /// Pipeline YAML; read from STREAMCONTEXT__* variables when absent
    #[arg(short, long)]
    pipeline: Option<PathBuf>,
    /// Bounded channel capacity between operators
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
    let args = Args::parse();
    let spec: PipelineSpec = match &args.pipeline {
        Some(path) => runner::load_spec(path)?,
        None => StreamContext::from_env()?.into_pipeline_spec()?,
    };

    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(cancel.clone()));

    match runner::run_pipeline(&spec, args.channel_capacity, cancel).await {
        Ok(()) => {
            info!(stream = %spec.name, "stream completed");
            Ok(())
        }
        // a schema change ends the stream; the supervisor schedules a backfill
        Err(e) if e.is_schema_mismatch() => {
            warn!(stream = %spec.name, error = %e, "stream stopped by schema change");
            TracingStatusReporter
                .report_schema_mismatch(&spec.name)
                .await?;
            Ok(())
        }
        Err(e) => {
            error!(stream = %spec.name, error = %e, "stream failed");
            Err(e.into())
        }
    }
}

async fn stop_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = until_delivered("Ctrl-C", signal::ctrl_c()) => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                until_delivered("Ctrl-C", signal::ctrl_c()).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        until_delivered("Ctrl-C", signal::ctrl_c()).await;
    }

    info!("shutdown requested, draining stream");
    cancel.cancel();
}

/// Resolves when the signal arrives; never resolves if its handler cannot be installed
async fn until_delivered(name: &str, signal: impl Future<Output = io::Result<()>>) {
    if let Err(e) = signal.await {
        warn!(signal = name, error = %e, "signal handler unavailable");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivered_signal_resolves() {
        let delivered = until_delivered("test", std::future::ready(Ok(())));
        assert!(tokio::time::timeout(Duration::from_secs(1), delivered).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_handler_never_resolves() {
        let failed = std::future::ready(Err(io::Error::new(io::ErrorKind::Other, "no handler")));
        let waiting = until_delivered("test", failed);
        assert!(tokio::time::timeout(Duration::from_millis(50), waiting).await.is_err());
    }
}
