//! Engine configuration (§6.4): TOML-backed, loaded from a per-user config
//! directory with env var overrides for credentials and serde defaults for
//! every numeric/bool field so a partial config file still parses — same
//! shape as the teacher's own `Config::load`/`save`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::FirstMessageMode;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sip: SipConfig,
    #[serde(default)]
    pub call_defaults: CallDefaults,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub number_canonicalization: NumberCanonicalizationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sip: SipConfig::default(),
            call_defaults: CallDefaults::default(),
            recording: RecordingConfig::default(),
            number_canonicalization: NumberCanonicalizationConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// SIP trunk and RTP defaults (§4.6, §4.7, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    #[serde(default = "default_sip_port")]
    pub default_port: u16,
    #[serde(default)]
    pub trunk_host: String,
    #[serde(default = "default_sip_port")]
    pub trunk_port: u16,
    #[serde(default)]
    pub username: String,
    /// Password is stored in the keyring under provider `"sip"`, not here.
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(default = "default_rtp_port_min")]
    pub rtp_port_min: u16,
    #[serde(default = "default_rtp_port_max")]
    pub rtp_port_max: u16,
    #[serde(default = "default_public_ip_endpoint")]
    pub public_ip_discovery_url: String,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_seconds: u64,
    #[serde(default = "default_invite_timeout")]
    pub invite_timeout_seconds: u64,
}

fn default_sip_port() -> u16 {
    5060
}

fn default_rtp_port_min() -> u16 {
    10000
}

fn default_rtp_port_max() -> u16 {
    20000
}

fn default_public_ip_endpoint() -> String {
    "https://api.ipify.org".to_string()
}

fn default_registration_timeout() -> u64 {
    10
}

fn default_invite_timeout() -> u64 {
    30
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            default_port: default_sip_port(),
            trunk_host: String::new(),
            trunk_port: default_sip_port(),
            username: String::new(),
            password: None,
            rtp_port_min: default_rtp_port_min(),
            rtp_port_max: default_rtp_port_max(),
            public_ip_discovery_url: default_public_ip_endpoint(),
            registration_timeout_seconds: default_registration_timeout(),
            invite_timeout_seconds: default_invite_timeout(),
        }
    }
}

/// Per-agent call defaults, overridable per call (§3 agent configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDefaults {
    #[serde(default = "default_first_message")]
    pub first_message: String,
    #[serde(default = "default_first_message_mode")]
    pub first_message_mode: FirstMessageMode,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_seconds: u64,
    #[serde(default = "default_response_delay")]
    pub response_delay_seconds: f64,
}

fn default_first_message() -> String {
    "Hello, how can I help you today?".to_string()
}

fn default_first_message_mode() -> FirstMessageMode {
    FirstMessageMode::AssistantSpeaksFirst
}

fn default_max_duration() -> u64 {
    600
}

fn default_silence_timeout() -> u64 {
    15
}

fn default_response_delay() -> f64 {
    0.3
}

impl Default for CallDefaults {
    fn default() -> Self {
        Self {
            first_message: default_first_message(),
            first_message_mode: default_first_message_mode(),
            max_duration_seconds: default_max_duration(),
            silence_timeout_seconds: default_silence_timeout(),
            response_delay_seconds: default_response_delay(),
        }
    }
}

/// Object-store destination for call recordings (§4.5). Absent bucket ⇒
/// the recording sink is a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordingConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl RecordingConfig {
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some()
    }
}

/// Configurable number-canonicalization policy (§4.6, §9 design note — the
/// source hard-codes "drop leading 91"; here it's a config-driven hook).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberCanonicalizationConfig {
    #[serde(default = "default_true")]
    pub strip_leading_plus: bool,
    #[serde(default = "default_country_code")]
    pub strip_country_code: Option<String>,
    #[serde(default = "default_min_remainder_digits")]
    pub min_remainder_digits: usize,
}

fn default_true() -> bool {
    true
}

fn default_country_code() -> Option<String> {
    Some("91".to_string())
}

fn default_min_remainder_digits() -> usize {
    10
}

impl Default for NumberCanonicalizationConfig {
    fn default() -> Self {
        Self {
            strip_leading_plus: default_true(),
            strip_country_code: default_country_code(),
            min_remainder_digits: default_min_remainder_digits(),
        }
    }
}

/// Hosted media-stream WebSocket server bind settings (§6.2, ambient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the per-user config file, creating it with
    /// defaults on first run.
    pub fn load() -> Result<Self> {
        let path = config_path()?;

        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read config file")?;
            let mut config: EngineConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = EngineConfig::default();
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Save configuration to the per-user config file.
    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        let parent = path.parent().context("Config path has no parent")?;
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply environment variable overrides for fields that shouldn't live
    /// in a file checked into source control (trunk host/credentials).
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("VOICE_ENGINE_SIP_TRUNK_HOST") {
            self.sip.trunk_host = host;
        }
        if let Ok(user) = std::env::var("VOICE_ENGINE_SIP_USERNAME") {
            self.sip.username = user;
        }
        if let Ok(pass) = std::env::var("VOICE_ENGINE_SIP_PASSWORD") {
            self.sip.password = Some(pass);
        }
    }
}

/// Get the configuration file path.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voice-call-engine", "voice-call-engine")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path (call records, recordings).
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voice-call-engine", "voice-call-engine")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}
