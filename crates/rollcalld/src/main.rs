use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use dbus_interface::{AppState, RollcallService};

const BUS_NAME: &str = "org.rollcall.Rollcall1";
const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::debug!(?config, "configuration");

    let engine::Engine { handle, finished } =
        engine::spawn_engine(&config).context("failed to start engine")?;
    let log = store::AttendanceLog::open(&config.db_path)
        .await
        .context("failed to open attendance log")?;

    let session_bus = config.session_bus;
    let service = RollcallService {
        state: Arc::new(Mutex::new(AppState {
            config,
            engine: handle,
            log,
        })),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to acquire {BUS_NAME}"))?;

    tracing::info!(bus = if session_bus { "session" } else { "system" }, "rollcalld ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
        }
        outcome = finished => {
            match outcome {
                Ok(Ok(())) => {
                    tracing::info!("frame source finished; still serving queries");
                    tokio::signal::ctrl_c().await?;
                }
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "camera failure, operator action required");
                    return Err(e).context("frame source failed");
                }
                Err(_) => anyhow::bail!("engine thread exited unexpectedly"),
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    Ok(())
}
