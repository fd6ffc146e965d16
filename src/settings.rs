use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::affinity::CacheConfig;
use crate::bundle::{DEFAULT_MAX_DPI, DEFAULT_MAX_PIXELS, RenderLimits};
use crate::convert::{BatchOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_PARALLELISM};
use crate::export::OutputFormat;
use crate::types::ImageMode;

const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagepool";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to write settings file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rendering settings read from `config.yaml`.
///
/// Missing keys take their defaults and unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_max_dpi")]
    pub max_dpi: u32,

    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,

    /// Seconds to wait at each shutdown phase
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_true")]
    pub allow_subsampling: bool,

    /// Draw annotations and form fields on rendered pages
    #[serde(default = "default_true")]
    pub include_annotations: bool,

    #[serde(default = "default_dpi")]
    pub default_dpi: u32,

    #[serde(default)]
    pub default_mode: ImageMode,

    #[serde(default)]
    pub default_format: OutputFormat,
}

fn default_true() -> bool {
    true
}

fn default_max_dpi() -> u32 {
    DEFAULT_MAX_DPI
}

fn default_max_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

fn default_grace_period_secs() -> u64 {
    60
}

fn default_dpi() -> u32 {
    300
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_dpi: default_max_dpi(),
            max_pixels: default_max_pixels(),
            batch_size: default_batch_size(),
            max_parallelism: default_max_parallelism(),
            grace_period_secs: default_grace_period_secs(),
            allow_subsampling: true,
            include_annotations: true,
            default_dpi: default_dpi(),
            default_mode: ImageMode::default(),
            default_format: OutputFormat::default(),
        }
    }
}

/// `<config dir>/pagepool/config.yaml`, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl RenderSettings {
    /// Read settings from `path`
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {path:?}");
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // an empty file deserializes as null
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Settings from the default config file, or defaults if there is none.
    ///
    /// A file that exists but cannot be read or parsed is logged and ignored.
    pub fn load_or_default() -> Self {
        let Some(path) = default_config_path() else {
            info!("Could not determine config directory, using default settings");
            return Self::default();
        };
        if !path.exists() {
            debug!("No settings file at {path:?}, using defaults");
            return Self::default();
        }
        Self::load_from(&path).unwrap_or_else(|e| {
            error!("{e}");
            Self::default()
        })
    }

    /// Write settings to `path`, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        let write_error = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(write_error)?;
            }
        }
        let content = serde_yaml::to_string(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(write_error)?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub fn render_limits(&self) -> RenderLimits {
        RenderLimits {
            max_dpi: self.max_dpi,
            max_pixels: self.max_pixels,
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            limits: self.render_limits(),
            allow_subsampling: self.allow_subsampling,
            include_annotations: self.include_annotations,
        }
    }

    /// Batch options with the worker count left to the page count
    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            parallelism: None,
            max_parallelism: self.max_parallelism,
            batch_size: self.batch_size,
            grace_period: self.grace_period(),
            cache: self.cache_config(),
        }
    }
}
