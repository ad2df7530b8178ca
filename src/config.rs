//! Viewer configuration
//!
//! Loads configuration from TOML file at `~/.config/vmview/config.toml`
//! Auto-generates default config file on first run if missing.

use crate::display::DisplayOptions;
use crate::scaling::ScaleConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable overriding the display channel socket
pub const SOCKET_ENV: &str = "VMVIEW_SOCKET";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub connection: ConnectionConfig,
    pub window: WindowConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let config = Self::load_from(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        debug!("Config: {:?}", config);
        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vmview");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Socket to connect to: `$VMVIEW_SOCKET`, then the config file, then the default
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os(SOCKET_ENV) {
            return PathBuf::from(path);
        }
        self.connection
            .socket
            .clone()
            .unwrap_or_else(vmview_proto::socket_path)
    }
}

/// Display configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Fit the guest image to the window
    pub scaling: bool,
    /// Never scale the guest image up
    pub only_downscale: bool,
    /// Zoom level in percent
    pub zoom_level: u32,
    /// Guest monitor to show; -1 shows the whole primary surface
    pub monitor_id: i32,
    /// Request guest resolution changes to follow the window
    pub resize_guest: bool,
    /// Use the EGL dma-buf path when the server offers scanouts
    pub hardware_acceleration: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            scaling: true,
            only_downscale: false,
            zoom_level: 100,
            monitor_id: -1,
            resize_guest: false,
            hardware_acceleration: true,
        }
    }
}

impl DisplayConfig {
    pub fn scale_config(&self) -> ScaleConfig {
        ScaleConfig {
            enabled: self.scaling,
            only_downscale: self.only_downscale,
            zoom_percent: self.zoom_level.max(1),
        }
    }

    pub fn display_options(&self) -> DisplayOptions {
        DisplayOptions {
            monitor_id: self.monitor_id,
            resize_guest: self.resize_guest,
            ..Default::default()
        }
    }
}

/// Display channel connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Socket path; defaults to `$XDG_RUNTIME_DIR/vmview.sock`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
}

/// Viewer window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            title: "vmview".to_string(),
        }
    }
}
