use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How the delivery clock paces points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// One point per tick interval
    FixedRate,
    /// Reconstruct the recorded gaps between point timestamps
    RealTime,
}

/// How progress percentages are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStyle {
    /// floor(100 * cursor / len), 0..=99
    ZeroBased,
    /// 1 + floor(100 * cursor / len), never shows 0%
    OneBased,
}

impl ProgressStyle {
    /// Percentage for a cursor position in a buffer of `len` points
    pub fn percent(self, cursor: usize, len: usize) -> u8 {
        if len == 0 {
            return 0;
        }
        let base = (cursor.min(len) * 100 / len) as u8;
        match self {
            ProgressStyle::ZeroBased => base.min(100),
            ProgressStyle::OneBased => base.saturating_add(1).min(100),
        }
    }
}

/// Persistent playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Fixed-rate tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Points per "minute" when jumping
    pub samples_per_minute: i64,
    pub mode: ReplayMode,
    /// Real-time playback speed multiplier (1.0 = recorded pace)
    pub speed: f64,
    pub progress_style: ProgressStyle,
    /// Name of the test provider registered with the sink
    pub provider_name: String,
    /// Upper bound for one sink call in milliseconds
    pub sink_timeout_ms: u64,
    /// Accuracy attached to every fix, in meters
    pub accuracy_m: f32,
}

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            samples_per_minute: 60,
            mode: ReplayMode::FixedRate,
            speed: 1.0,
            progress_style: ProgressStyle::OneBased,
            provider_name: "gps".to_string(),
            sink_timeout_ms: 500,
            accuracy_m: 5.0,
        }
    }
}

impl ReplaySettings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("gpsplay").join("settings.json"))
    }

    /// Load settings from the user config directory, falling back to defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            debug!("No settings at {:?}, using defaults", path);
            return Self::default();
        }

        match fs::read_to_string(path).map(|s| serde_json::from_str::<Self>(&s)) {
            Ok(Ok(settings)) => settings.sanitized(),
            Ok(Err(e)) => {
                warn!("Ignoring malformed settings file {:?}: {}", path, e);
                Self::default()
            }
            Err(e) => {
                warn!("Could not read settings file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        match Self::config_path() {
            Some(path) => self.save_to(&path),
            None => anyhow::bail!("No config directory on this platform"),
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Clamp values into their usable ranges
    pub fn sanitized(mut self) -> Self {
        self.tick_interval_ms = self.tick_interval_ms.max(1);
        self.samples_per_minute = self.samples_per_minute.max(1);
        self.speed = if self.speed.is_finite() {
            self.speed.clamp(MIN_SPEED, MAX_SPEED)
        } else {
            1.0
        };
        self.sink_timeout_ms = self.sink_timeout_ms.max(1);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}
