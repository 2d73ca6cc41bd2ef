/// Signal handling for graceful shutdown.
///
/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM. The caller then stops
/// accepting requests, signals the liveness monitor and stops every worker.
use tokio::signal::unix::{signal, SignalKind};

pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };

    let terminate = async {
        match sigterm.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(terminate);

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("received SIGINT, shutting down"),
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C, waiting for SIGTERM");
                (&mut terminate).await;
                tracing::info!("received SIGTERM, shutting down");
            }
        },
        _ = &mut terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
