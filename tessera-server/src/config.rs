//! Configuration for the screen-sharing server.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::MonitorConfig;

/// Smallest tile edge accepted from configuration.
const MIN_SEGMENT_EDGE: u32 = 8;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Screen capture settings.
    pub screen: ScreenConfig,
    /// Viewer authentication.
    pub security: SecurityConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Displays to serve, in screen-index order.
    pub displays: Vec<DisplayConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the viewer listener on.
    pub bind_address: String,
    /// TCP port for viewer connections.
    pub port: u16,
    /// Maximum concurrent viewers (0 = unlimited).
    pub max_connections: u32,
}

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Tile width in pixels.
    pub segment_width: u32,
    /// Tile height in pixels.
    pub segment_height: u32,
    /// Sleep between capture passes to honour viewer refresh requests.
    pub obey_speed_limits: bool,
    /// Fastest refresh any viewer may request, in milliseconds.
    pub min_refresh_ms: u64,
    /// Refresh period while no viewer has a request, in milliseconds.
    pub idle_refresh_ms: u64,
    /// Refresh period registered for a viewer until it asks for its own.
    pub default_refresh_ms: u64,
}

/// Viewer authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Password every viewer must present. Empty disables the check.
    pub password: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

/// A synthetic display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub name: String,
    /// Position on the virtual desktop.
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Period of the test-pattern animation in milliseconds (0 = static).
    pub animate_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 7420,
            max_connections: 0,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            segment_width: 64,
            segment_height: 64,
            obey_speed_limits: true,
            min_refresh_ms: 40,
            idle_refresh_ms: 5000,
            default_refresh_ms: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: "primary".into(),
            x: 0,
            y: 0,
            width: 1280,
            height: 720,
            animate_ms: 50,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Configured displays, or a single default one if none are listed.
    pub fn displays(&self) -> Vec<DisplayConfig> {
        if self.displays.is_empty() {
            vec![DisplayConfig::default()]
        } else {
            self.displays.clone()
        }
    }

    /// `None` when no password is configured.
    pub fn password(&self) -> Option<&str> {
        Some(self.security.password.as_str()).filter(|p| !p.is_empty())
    }

    pub fn default_refresh(&self) -> Duration {
        Duration::from_millis(self.screen.default_refresh_ms)
    }

    /// Convert capture settings into a core `MonitorConfig`.
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            segment_width: self.screen.segment_width.max(MIN_SEGMENT_EDGE),
            segment_height: self.screen.segment_height.max(MIN_SEGMENT_EDGE),
            obey_speed_limits: self.screen.obey_speed_limits,
            min_refresh: Duration::from_millis(self.screen.min_refresh_ms.max(1)),
            idle_refresh: Duration::from_millis(self.screen.idle_refresh_ms.max(1)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
