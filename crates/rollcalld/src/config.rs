use rollcall_core::liveness::BlinkPolicy;
use rollcall_core::recognizer::ARCFACE_MATCH_THRESHOLD;
use rollcall_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path, or an image file to process once.
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Reference images, one per identity.
    pub gallery_dir: PathBuf,
    /// Where stranger crops are written.
    pub strangers_dir: PathBuf,
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match (inclusive). The
    /// default is calibrated for the bundled ArcFace model.
    pub match_threshold: f32,
    /// EAR below this counts as a closed eye.
    pub ear_threshold: f32,
    pub min_closed_frames: u32,
    pub max_closed_frames: u32,
    /// Seconds an unconsumed blink stays valid; 0 disables expiry.
    pub liveness_ttl_secs: u64,
    /// Processed frames an identity may be absent before its blink state resets.
    pub inactivity_frames: u64,
    /// Minimum seconds between saved stranger crops; 0 saves every one.
    pub stranger_cooldown_secs: u64,
    /// Capture→processing queue depth, clamped to 1..=2.
    pub queue_capacity: usize,
    /// Frames discarded at camera start (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("rollcall")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("rollcall")
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        let pipeline = PipelineConfig::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            gallery_dir: data.join("gallery"),
            strangers_dir: data.join("strangers"),
            db_path: data.join("attendance.db"),
            match_threshold: ARCFACE_MATCH_THRESHOLD,
            ear_threshold: pipeline.blink.closed_threshold,
            min_closed_frames: pipeline.blink.min_closed_frames,
            max_closed_frames: pipeline.blink.max_closed_frames,
            liveness_ttl_secs: pipeline.blink.confirmation_ttl.map_or(0, |d| d.as_secs()),
            inactivity_frames: pipeline.inactivity_frames,
            stranger_cooldown_secs: 0,
            queue_capacity: 2,
            warmup_frames: 4,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (or the XDG config file if it exists),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .or_else(|| Some(config_dir().join("rollcall.toml")).filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config.normalized())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&src).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = &lookup;
        env_override(lookup, "ROLLCALL_CAMERA_DEVICE", &mut self.camera_device);
        env_override(lookup, "ROLLCALL_MODEL_DIR", &mut self.model_dir);
        env_override(lookup, "ROLLCALL_GALLERY_DIR", &mut self.gallery_dir);
        env_override(lookup, "ROLLCALL_STRANGERS_DIR", &mut self.strangers_dir);
        env_override(lookup, "ROLLCALL_DB_PATH", &mut self.db_path);
        env_override(lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        env_override(lookup, "ROLLCALL_EAR_THRESHOLD", &mut self.ear_threshold);
        env_override(lookup, "ROLLCALL_MIN_CLOSED_FRAMES", &mut self.min_closed_frames);
        env_override(lookup, "ROLLCALL_MAX_CLOSED_FRAMES", &mut self.max_closed_frames);
        env_override(lookup, "ROLLCALL_LIVENESS_TTL_SECS", &mut self.liveness_ttl_secs);
        env_override(lookup, "ROLLCALL_INACTIVITY_FRAMES", &mut self.inactivity_frames);
        env_override(lookup, "ROLLCALL_STRANGER_COOLDOWN_SECS", &mut self.stranger_cooldown_secs);
        env_override(lookup, "ROLLCALL_QUEUE_CAPACITY", &mut self.queue_capacity);
        env_override(lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        if let Some(v) = lookup("ROLLCALL_SESSION_BUS") {
            self.session_bus = v != "0";
        }
    }

    fn normalized(mut self) -> Self {
        self.queue_capacity = self.queue_capacity.clamp(1, 2);
        if self.min_closed_frames > self.max_closed_frames {
            tracing::warn!(
                min = self.min_closed_frames,
                max = self.max_closed_frames,
                "min_closed_frames exceeds max_closed_frames, raising max"
            );
            self.max_closed_frames = self.min_closed_frames;
        }
        self
    }

    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// 68-point landmark model used for eye contours.
    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join("landmarks_68.onnx")
    }

    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            blink: BlinkPolicy {
                closed_threshold: self.ear_threshold,
                min_closed_frames: self.min_closed_frames,
                max_closed_frames: self.max_closed_frames,
                confirmation_ttl: (self.liveness_ttl_secs > 0)
                    .then(|| Duration::from_secs(self.liveness_ttl_secs)),
            },
            inactivity_frames: self.inactivity_frames,
        }
    }

    pub fn stranger_cooldown(&self) -> Duration {
        Duration::from_secs(self.stranger_cooldown_secs)
    }
}

/// Replace `slot` with the parsed variable; unparsable values are logged and ignored.
fn env_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}
