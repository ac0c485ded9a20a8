//! # DHT Telemetry Relay
//!
//! Subscribes to the sensor topic on the MQTT broker and pushes every reading to the
//! browsers connected on `/ws`, as `mqtt_data` events.
//!
//! Two activities run for the life of the process: the broker link (ingestion) and
//! the viewer server. They meet in the session registry, fed by the relay task.

use anyhow::Result;
use lib_relay::{BrokerLink, Relay, RelayStats, SessionRegistry, record_channel};
use std::sync::Arc;
use tokio::signal;
use tokio::task::{JoinError, JoinHandle};

mod relay_logic;
use relay_logic::{config, downstream, logger, monitor, state};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config()?;
    let log_file = logger::LogSettings::new(&settings.log_dir, &settings.log_level).install()?;
    log::info!("Logging to {}", log_file.display());
    log::info!(
        "DHT relay booting: broker {}:{} topic '{}', viewers on port {}",
        settings.broker.host,
        settings.broker.port,
        settings.broker.topic,
        settings.port
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let registry = Arc::new(SessionRegistry::new(settings.max_sessions));
    let stats = Arc::new(RelayStats::default());

    // Ingestion hands decoded records to the relay; the relay fans them out.
    let (sink, source) = record_channel();
    let relay_handle = tokio::spawn(Relay::new(registry.clone(), stats.clone()).run(source));
    let link = BrokerLink::start(settings.broker.clone(), sink, stats.clone());

    let app_state = state::AppState::new(
        registry.clone(),
        stats.clone(),
        link.subscribe_state(),
        &settings,
    );

    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let monitor_handle = tokio::spawn(monitor::run(
        settings.stale_after,
        stats.clone(),
        link.subscribe_state(),
        shutdown_tx.subscribe(),
    ));

    // Wait for a shutdown signal, or for the viewer server to die on its own
    let early_exit = wait_for_exit(shutdown_signal(), &mut downstream_handle).await;

    // Stopping the link drops the record sink, which ends the relay task.
    link.shutdown().await;
    let closed = registry.clear();
    log::info!("Closed {} viewer session(s).", closed);

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    let downstream_result = match early_exit {
        Some(res) => res,
        None => downstream_handle.await,
    };
    let _ = tokio::join!(relay_handle, monitor_handle);

    log::info!("Shutdown complete.");
    match downstream_result {
        Ok(res) => res,
        Err(e) => Err(e.into()),
    }
}

type DownstreamExit = Result<Result<()>, JoinError>;

/// Returns the viewer server's result if it stopped first, `None` once a shutdown
/// signal arrived. A signal listener that cannot be installed also means shut down,
/// so the broker link and the sessions are still released in order.
async fn wait_for_exit<F>(signal: F, downstream: &mut JoinHandle<Result<()>>) -> Option<DownstreamExit>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        res = signal => {
            if let Err(e) = res {
                log::error!("Failed to listen for shutdown signals: {}. Shutting down.", e);
            }
            None
        }
        res = downstream => Some(res),
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}
