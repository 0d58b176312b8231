use anyhow::{Context, Result};
use lib_common::{GrammarSet, Ingestor, SqliteStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

mod ccd_logic;
use ccd_logic::{config, listener, logger};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = match config::load_config().and_then(|c| c.resolve()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("server_ccd: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    logger::setup_logging(&config.log_dir, &config.log_level)?;
    log::info!(
        "Starting server_ccd on {}:{} (database {})",
        config.hostname,
        config.port,
        config.database.display()
    );

    let grammars = match &config.templates {
        Some(dir) => GrammarSet::load_dir(dir)
            .with_context(|| format!("loading templates from {}", dir.display()))?,
        None => GrammarSet::builtin()?,
    };
    if grammars.is_empty() {
        anyhow::bail!("no grammar templates loaded; every section would be unknown");
    }
    log::info!("Loaded {} section grammar(s)", grammars.len());

    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("opening database {}", config.database.display()))?;
    let ingestor = Arc::new(Ingestor::new(grammars, Arc::new(store))?);

    let tcp = TcpListener::bind((config.hostname.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.hostname, config.port))?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let listener_handle = tokio::spawn(listener::run(
        tcp,
        ingestor,
        config.listener_settings(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());
    listener_handle.await??;

    log::info!("Shutdown complete.");
    Ok(())
}
