//! Hub tuning parameters and the TOML settings file

use crate::error::ConfigError;
use crate::format::PcmFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tuning parameters of one hub
///
/// The defaults are empirically chosen for Bluetooth links; they trade
/// latency against tolerance to client scheduling jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Period length in milliseconds, used when `period_frames` is unset
    pub period_ms: u32,

    /// Exact period length in frames
    pub period_frames: Option<usize>,

    /// Mix buffer capacity, in periods
    pub buffer_periods: usize,

    /// Periods accumulated in the mix before playback starts
    pub mix_threshold_periods: usize,

    /// Periods a playback client buffers before it joins the mix
    pub client_threshold_periods: usize,

    /// Maximum number of simultaneous clients
    pub max_clients: usize,

    /// Time allowed for the remote device to play out a drained stream
    pub drain_timeout_ms: u64,

    /// Attenuation applied to the mix when the remote device owns the volume
    pub native_volume: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            period_ms: 20,
            period_frames: None,
            buffer_periods: 16,
            mix_threshold_periods: 4,
            client_threshold_periods: 2,
            max_clients: 32,
            drain_timeout_ms: 300,
            native_volume: 1.0,
        }
    }
}

impl HubConfig {
    /// Check the parameters are mutually consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_frames == Some(0) || (self.period_frames.is_none() && self.period_ms == 0) {
            return Err(ConfigError::Invalid("period must be > 0".into()));
        }
        if self.buffer_periods == 0 {
            return Err(ConfigError::Invalid("buffer_periods must be > 0".into()));
        }
        if self.mix_threshold_periods == 0 || self.mix_threshold_periods >= self.buffer_periods {
            return Err(ConfigError::Invalid(format!(
                "mix_threshold_periods must be in 1..{}",
                self.buffer_periods
            )));
        }
        if self.client_threshold_periods == 0 {
            return Err(ConfigError::Invalid(
                "client_threshold_periods must be > 0".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.native_volume) {
            return Err(ConfigError::Invalid(
                "native_volume must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    /// Period length in frames for the given stream format
    pub fn period_frames(&self, format: &PcmFormat) -> usize {
        self.period_frames
            .unwrap_or_else(|| format.frames_for_ms(self.period_ms))
            .max(1)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Capacity of the event queue feeding the hub worker
    ///
    /// Room for data, control and hangup events of every client plus the
    /// internal wake.
    pub fn event_queue_depth(&self) -> usize {
        1 + self.max_clients * 3
    }
}

/// Contents of the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = log to stderr)
    #[serde(default)]
    pub log_file: String,

    /// Hub tuning
    pub hub: HubConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: String::new(),
            hub: HubConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        let settings: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;
        settings.hub.validate()?;
        Ok(settings)
    }

    /// Default settings file location: `<config dir>/pcmhub/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pcmhub").join("config.toml"))
    }

    /// Load settings from the default location, or defaults if there is no file
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save settings to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }
}
