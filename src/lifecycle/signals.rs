//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The first SIGTERM/SIGINT asks for a graceful stop, the next one forces

use crate::http::server::Dispatcher;

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Stop `dispatcher` on the first signal; force it on the second.
pub async fn stop_on_signal(dispatcher: &Dispatcher) {
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining");

    let graceful = dispatcher.stop(false);
    tokio::pin!(graceful);
    tokio::select! {
        result = &mut graceful => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Graceful stop failed");
            }
        }
        _ = shutdown_signal() => {
            tracing::warn!("Second signal received, forcing shutdown");
            if let Err(e) = dispatcher.stop(true).await {
                tracing::error!(error = %e, "Forced stop failed");
            }
            if let Err(e) = graceful.await {
                tracing::error!(error = %e, "Stop failed");
            }
        }
    }
}
