//! Configuration management for huddle
//!
//! This crate handles loading, saving and accessing
//! application configuration. Values come from built-in defaults, then the
//! TOML config file, then `HUDDLE_*` environment variables.

use log::debug;
use mesh_core::Error;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "HUDDLE";

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// User's display name
    pub username: String,

    /// List of STUN/TURN servers for WebRTC connectivity
    pub ice_servers: Vec<String>,

    /// A call still negotiating after this long is abandoned
    pub call_timeout_ms: u64,

    /// Signaling endpoint
    pub signaling: SignalingSettings,

    /// Reconnection backoff
    pub reconnect: ReconnectSettings,

    /// Peer discovery
    pub discovery: DiscoverySettings,

    /// Speaking detection
    pub speaking: SpeakingSettings,

    /// Microphone capture
    pub capture: CaptureSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            username: "Anonymous".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            call_timeout_ms: 30_000,
            signaling: SignalingSettings::default(),
            reconnect: ReconnectSettings::default(),
            discovery: DiscoverySettings::default(),
            speaking: SpeakingSettings::default(),
            capture: CaptureSettings::default(),
        }
    }
}

impl Settings {
    /// Negotiation deadline for a single call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Where the rendezvous server lives and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingSettings {
    pub host: String,
    pub port: u16,
    /// Use TLS (wss/https)
    pub secure: bool,
    /// Mount path of the server, with leading and trailing slash
    pub path: String,
    /// API key the server was started with
    pub key: String,
    pub heartbeat_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            secure: false,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            heartbeat_interval_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl SignalingSettings {
    fn base(&self, secure_scheme: &str, plain_scheme: &str) -> String {
        let scheme = if self.secure {
            secure_scheme
        } else {
            plain_scheme
        };
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }

    /// Base URL for the WebSocket control connection
    pub fn websocket_base(&self) -> String {
        self.base("wss", "ws")
    }

    /// URL of the peer-listing resource
    pub fn directory_url(&self) -> String {
        format!("{}{}/peers", self.base("https", "http"), self.key)
    }

    /// Never zero; timers reject a zero period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Linear backoff for signaling reconnection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
        }
    }
}

impl ReconnectSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Only identities in this namespace are called
    pub namespace: String,
    /// Pause between connecting and querying the directory
    pub delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            namespace: mesh_core::IDENTITY_NAMESPACE.to_string(),
            delay_ms: 1_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl DiscoverySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingSettings {
    /// Average spectrum energy (0-255) above which a peer counts as speaking
    pub threshold: f32,
    pub sample_interval_ms: u64,
    /// Analysis window, a power of two
    pub fft_size: usize,
    /// Exponential smoothing between successive spectra (0..1)
    pub smoothing: f32,
}

impl Default for SpeakingSettings {
    fn default() -> Self {
        Self {
            threshold: 25.0,
            sample_interval_ms: 16,
            fft_size: 256,
            smoothing: 0.8,
        }
    }
}

impl SpeakingSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Preferred input device (empty string means system default)
    pub input_device: String,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Length of each captured frame
    pub frame_ms: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            input_device: String::new(),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            frame_ms: 20,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    settings: Settings,
    config_file: PathBuf,
}

impl ConfigManager {
    /// Create a config manager backed by the user's config directory
    pub fn new() -> Result<Self, Error> {
        // Get user's config directory
        let mut config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Failed to determine config directory".to_string()))?;
        config_dir.push("huddle");

        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        Self::with_file(config_dir.join("config.toml"))
    }

    /// Create a new ConfigManager with a custom file path (mainly for testing)
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_file = path.as_ref().to_path_buf();
        if !config_file.exists() {
            debug!("Config file {:?} not found, using defaults", config_file);
        }
        let settings = Self::load(&config_file)?;

        Ok(Self {
            settings,
            config_file,
        })
    }

    /// Layer the file (if present) and the environment over the defaults
    fn load(path: &Path) -> Result<Settings, Error> {
        config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Save settings to the config file
    pub fn save(&self) -> Result<(), Error> {
        let toml = toml::to_string_pretty(&self.settings)
            .map_err(|e| Error::Config(format!("Failed to serialize settings: {}", e)))?;

        // Ensure parent directory exists
        if let Some(parent) = self.config_file.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        fs::write(&self.config_file, toml)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.config_file
    }

    /// Get the current settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get a mutable reference to settings
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
