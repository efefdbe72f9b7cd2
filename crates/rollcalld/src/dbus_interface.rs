use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::store::{self, AttendanceLog};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub log: AttendanceLog,
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(context: &str, e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "{context} failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn invalid_date(raw: &str, e: chrono::ParseError) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(format!("invalid date {raw:?} (expected YYYY-MM-DD): {e}"))
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Register an identity from a reference image on the daemon's filesystem.
    ///
    /// Returns the identity as it will be reported in attendance records.
    async fn register(&self, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, image_path, "register requested");
        if name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("name must not be empty".into()));
        }

        // Copy the handle out, then release the lock before waiting on the engine
        let engine = self.state.lock().await.engine.clone();
        engine
            .register(name.trim(), PathBuf::from(image_path))
            .await
            .map_err(|e| failed("register", e))
    }

    /// JSON array of registered identities.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.state.lock().await.engine.identities();
        serde_json::to_string(&identities).map_err(|e| failed("list_identities", e))
    }

    /// JSON attendance records for `date` (`YYYY-MM-DD`, empty for today).
    async fn attendance(&self, date: &str) -> zbus::fdo::Result<String> {
        let day = store::parse_day(date).map_err(|e| invalid_date(date, e))?;
        let log = self.state.lock().await.log.clone();
        let records = log.records_for(day).await.map_err(|e| failed("attendance", e))?;
        serde_json::to_string(&records).map_err(|e| failed("attendance", e))
    }

    /// JSON stranger captures for `date` (`YYYY-MM-DD`, empty for today).
    async fn strangers(&self, date: &str) -> zbus::fdo::Result<String> {
        let day = store::parse_day(date).map_err(|e| invalid_date(date, e))?;
        let log = self.state.lock().await.log.clone();
        let entries = log.strangers_for(day).await.map_err(|e| failed("strangers", e))?;
        serde_json::to_string(&entries).map_err(|e| failed("strangers", e))
    }

    /// Rescan the gallery directory. Returns the number of identities loaded.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        let engine = self.state.lock().await.engine.clone();
        let count = engine.reload().await.map_err(|e| failed("reload", e))?;
        Ok(count as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (engine, config) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.config.clone())
        };
        let stats = engine.stats().await.map_err(|e| failed("status", e))?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": config.camera_device,
            "source": stats.source,
            "source_finished": stats.source_finished,
            "gallery_size": engine.gallery_size(),
            "match_threshold": config.match_threshold,
            "ear_threshold": config.ear_threshold,
            "min_closed_frames": config.min_closed_frames,
            "max_closed_frames": config.max_closed_frames,
            "frames_captured": stats.frames_captured,
            "frames_processed": stats.frames_processed,
            "frames_dropped": stats.frames_dropped,
            "tracked_identities": stats.tracked_identities,
        })
        .to_string())
    }
}
