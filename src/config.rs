//! Application configuration
//!
//! Read once at startup and handed to the engine as `Arc<AppConfig>`.
//!
//! Files are loaded in order (later wins):
//! 1. Compiled defaults
//! 2. `<config_dir>/live-assistant/config.toml` (user)
//! 3. `./live-assistant.toml`, or the path given on the command line
//! 4. `.env` and environment variables

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::ConfigError;

/// Local override file name
pub const LOCAL_CONFIG_FILE: &str = "live-assistant.toml";

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub screen: ScreenConfig,
    pub playback: PlaybackConfig,
    pub transport: TransportConfig,
    pub session: SessionTimings,
    pub overlay: OverlayConfig,
}

/// Microphone settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device id (`input:<name>`), default device when absent
    pub device_id: Option<String>,
    /// Outbound sample rate
    pub sample_rate: u32,
    /// Outbound chunk duration
    pub chunk_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_SEND_SAMPLE_RATE,
            chunk_ms: DEFAULT_AUDIO_CHUNK_MS,
        }
    }
}

impl CaptureConfig {
    /// Mono samples per outbound chunk
    pub fn samples_per_chunk(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

/// Screen capture settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    /// Skip frames whose pixels did not change
    pub dedup: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_SCREEN_INTERVAL_MS,
            max_dimension: DEFAULT_SCREEN_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            dedup: true,
        }
    }
}

impl ScreenConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Reply playback settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device id (`output:<name>`), default device when absent
    pub device_id: Option<String>,
    /// Sample rate of inbound reply audio
    pub sample_rate: u32,
    /// Jitter window; buffered audio never exceeds it
    pub window_ms: u64,
    pub gap_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_RECEIVE_SAMPLE_RATE,
            window_ms: DEFAULT_PLAYBACK_WINDOW_MS,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
        }
    }
}

impl PlaybackConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

/// Where the credential goes on the upgrade request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialPlacement {
    /// `Authorization: Bearer <credential>`
    #[default]
    Bearer,
    /// `?key=<credential>`
    Query,
}

/// Bearer credential for the remote service
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Credential::new)
    }
}

/// Remote service connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub credential: Option<Credential>,
    pub credential_placement: CredentialPlacement,
    /// Target model identifier
    pub model: String,
    /// Prebuilt voice for replies
    pub voice: String,
    pub outbound_capacity: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credential: None,
            credential_placement: CredentialPlacement::default(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

/// Session lifecycle timings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    /// T_start
    pub start_timeout_ms: u64,
    /// T_flush
    pub flush_ms: u64,
    /// T_forceclose
    pub force_close_ms: u64,
    /// N_max
    pub reconnect_attempts: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            flush_ms: DEFAULT_FLUSH_MS,
            force_close_ms: DEFAULT_FORCE_CLOSE_MS,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

impl SessionTimings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn flush(&self) -> Duration {
        Duration::from_millis(self.flush_ms)
    }

    pub fn force_close(&self) -> Duration {
        Duration::from_millis(self.force_close_ms)
    }
}

/// Overlay indicator placement, consumed by presenters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub size: u32,
    pub margin: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_OVERLAY_SIZE,
            margin: DEFAULT_OVERLAY_MARGIN,
        }
    }
}

impl OverlayConfig {
    /// Top-left corner of the indicator anchored bottom-right on a screen
    pub fn anchor(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        let inset = self.size + self.margin;
        (
            screen_width.saturating_sub(inset),
            screen_height.saturating_sub(inset),
        )
    }
}

impl AppConfig {
    /// Load from all sources
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load with an explicit file taking the place of `./live-assistant.toml`
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in discover_config_files(config_path) {
            tracing::debug!("Loading config from {}", path.display());
            merge_values(&mut merged, read_file(&path)?);
        }

        let mut config: AppConfig = merged.try_into().map_err(|e: toml::de::Error| {
            ConfigError::Parse {
                path: PathBuf::from("<merged>"),
                message: e.to_string(),
            }
        })?;

        dotenvy::dotenv().ok();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document on top of defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(CREDENTIAL_ENV).or_else(|| lookup(CREDENTIAL_ENV_FALLBACK)) {
            if !key.is_empty() {
                self.transport.credential = Some(Credential::new(key));
            }
        }
        if let Some(model) = lookup(MODEL_ENV) {
            if !model.is_empty() {
                self.transport.model = model;
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !AUDIO_CHUNK_MS_RANGE.contains(&self.capture.chunk_ms) {
            return Err(ConfigError::Invalid(format!(
                "capture.chunk_ms must be within {:?}, got {}",
                AUDIO_CHUNK_MS_RANGE, self.capture.chunk_ms
            )));
        }
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rates must be non-zero".into()));
        }
        if self.screen.interval_ms < MIN_SCREEN_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "screen.interval_ms must be at least {}",
                MIN_SCREEN_INTERVAL_MS
            )));
        }
        if self.screen.jpeg_quality == 0 || self.screen.jpeg_quality > 100 {
            return Err(ConfigError::Invalid("screen.jpeg_quality must be 1-100".into()));
        }
        if self.playback.window_ms == 0 {
            return Err(ConfigError::Invalid("playback.window_ms must be non-zero".into()));
        }
        if self.transport.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "transport.outbound_capacity must be non-zero".into(),
            ));
        }
        if self.session.flush_ms > self.session.force_close_ms {
            return Err(ConfigError::Invalid(
                "session.flush_ms must not exceed session.force_close_ms".into(),
            ));
        }
        if !(1..=MAX_RECONNECT_ATTEMPTS).contains(&self.session.reconnect_attempts) {
            return Err(ConfigError::Invalid(format!(
                "session.reconnect_attempts must be within 1..={}, got {}",
                MAX_RECONNECT_ATTEMPTS, self.session.reconnect_attempts
            )));
        }
        let transport = &self.transport;
        for (name, value) in [
            ("connect_timeout_ms", transport.connect_timeout_ms),
            ("idle_timeout_ms", transport.idle_timeout_ms),
            ("heartbeat_ms", transport.heartbeat_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "transport.{} must be non-zero",
                    name
                )));
            }
        }
        // A heartbeat must land before the peer's idle timer fires
        if transport.heartbeat_ms >= transport.idle_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "transport.heartbeat_ms ({}) must be shorter than transport.idle_timeout_ms ({})",
                transport.heartbeat_ms, transport.idle_timeout_ms
            )));
        }
        Ok(())
    }

    /// Validation that only matters once we are about to connect
    pub fn validate_for_connect(&self) -> Result<(), ConfigError> {
        self.validate()?;
        match &self.transport.credential {
            Some(credential) if !credential.expose().is_empty() => Ok(()),
            _ => Err(ConfigError::Invalid(format!(
                "no credential configured; set {} or transport.credential",
                CREDENTIAL_ENV
            ))),
        }
    }
}

/// Config files that exist, lowest precedence first
pub fn discover_config_files(override_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Some(dirs) = directories::ProjectDirs::from("", "", "live-assistant") {
        let user = dirs.config_dir().join("config.toml");
        if user.is_file() {
            files.push(user);
        }
    }

    match override_path {
        Some(path) => files.push(path.to_path_buf()),
        None => {
            let local = PathBuf::from(LOCAL_CONFIG_FILE);
            if local.is_file() {
                files.push(local);
            }
        }
    }

    files
}

fn read_file(path: &Path) -> Result<toml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`; tables merge, everything else replaces
fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
