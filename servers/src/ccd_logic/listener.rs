use anyhow::Result;
use lib_common::Ingestor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::task::TaskTracker;

use super::handler::{self, ConnectionSettings};

#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub connection: ConnectionSettings,
    /// 0 means no limit.
    pub max_connections: usize,
}

/// Accepts connections until `shutdown` fires, one task per connection.
/// In-flight handlers are awaited before returning.
pub async fn run(
    listener: TcpListener,
    ingestor: Arc<Ingestor>,
    settings: ListenerSettings,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let limiter = (settings.max_connections > 0).then(|| Arc::new(Semaphore::new(settings.max_connections)));
    let tracker = TaskTracker::new();

    if let Ok(addr) = listener.local_addr() {
        log::info!("Listening on {}", addr);
    }

    loop {
        let permit = match &limiter {
            Some(semaphore) => tokio::select! {
                _ = shutdown.recv() => break,
                permit = Arc::clone(semaphore).acquire_owned() => Some(permit?),
            },
            None => None,
        };

        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let ingestor = Arc::clone(&ingestor);
        let connection = settings.connection;
        tracker.spawn(async move {
            let _permit = permit;
            // Outcome and errors are logged by the handler.
            let _ = handler::handle_connection(stream, peer, &ingestor, &connection).await;
        });
    }

    log::info!("Listener shutting down, waiting for {} connection(s).", tracker.len());
    tracker.close();
    tracker.wait().await;
    log::info!("All connections finished.");
    Ok(())
}
