//! Configuration for the uplink daemon and the collector.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Uplink config file location:
//!   1. $MURMUR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/murmur/uplink.toml
//!   3. ~/.config/murmur/uplink.toml
//!
//! Collector config file location:
//!   1. $MURMUR_COLLECTOR_CONFIG
//!   2. $XDG_CONFIG_HOME/murmur/collector.toml
//!   3. ~/.config/murmur/collector.toml

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level uplink (edge device) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub spool: SpoolConfig,
    pub transcoder: TranscoderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Collector ingest WebSocket URL. The token is appended as `?token=`.
    pub ws_url: String,
    /// Token-issuing endpoint.
    pub auth_url: String,
    /// Delay before retrying after an auth or connect failure, or a drop.
    pub reconnect_interval_ms: u64,
    /// Upper bound for the retry delay. Equal to `reconnect_interval_ms` = fixed interval.
    pub max_reconnect_interval_ms: u64,
    pub auth_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest a single live send may take before the connection is dropped.
    pub send_timeout_ms: u64,
    /// Pending live sends buffered in front of the connection loop.
    pub send_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory holding spooled records. Created if absent.
    pub dir: PathBuf,
    /// fsync each record (and the directory) before it becomes visible.
    pub fsync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    pub input_path: PathBuf,
    pub silence_filter: String,
    pub codec: String,
    pub bitrate: String,
    pub format: String,
    /// Read input at its native frame rate (`-re`).
    pub realtime: bool,
    /// Largest chunk handed to the uplink per stdout read.
    pub read_chunk_bytes: usize,
}

/// Top-level collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub bind: String,
    pub port: u16,
    /// Lifetime of issued access tokens.
    pub token_ttl_secs: u64,
    /// Provisioned devices allowed to obtain tokens.
    pub devices: Vec<DeviceCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub device_id: String,
    pub device_secret: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "device-001".to_string(),
            device_secret: "secret-001".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ingest".to_string(),
            auth_url: "http://localhost:8080/auth/login".to_string(),
            reconnect_interval_ms: 3000,
            max_reconnect_interval_ms: 3000,
            auth_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            send_timeout_ms: 5000,
            send_queue_depth: 64,
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("buffer"),
            fsync: true,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            input_path: PathBuf::from("./input.wav"),
            silence_filter: "silenceremove=stop_periods=-1:stop_duration=0.5:stop_threshold=-40dB"
                .to_string(),
            codec: "libopus".to_string(),
            bitrate: "32k".to_string(),
            format: "ogg".to_string(),
            realtime: true,
            read_chunk_bytes: 4096,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            token_ttl_secs: 3600,
            devices: vec![DeviceCredential {
                device_id: "device-001".to_string(),
                device_secret: "secret-001".to_string(),
            }],
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms.max(self.reconnect_interval_ms))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl TranscoderConfig {
    /// Full argument list passed to the transcoder program.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.realtime {
            args.push("-re".to_string());
        }
        args.extend([
            "-i".to_string(),
            self.input_path.to_string_lossy().into_owned(),
            "-af".to_string(),
            self.silence_filter.clone(),
            "-c:a".to_string(),
            self.codec.clone(),
            "-b:a".to_string(),
            self.bitrate.clone(),
            "-f".to_string(),
            self.format.clone(),
            "pipe:1".to_string(),
        ]);
        args
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("murmur")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("murmur")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

fn load_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
    toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
}

fn write_default<T: Serialize + Default>(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        let text = toml::to_string_pretty(&T::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
    }
    Ok(path)
}

impl UplinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Self = load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("MURMUR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("uplink.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        write_default::<Self>(Self::file_path())
    }

    /// Apply MURMUR_* overrides read through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MURMUR_DEVICE__ID") {
            self.device.device_id = v;
        }
        if let Some(v) = var("MURMUR_DEVICE__SECRET") {
            self.device.device_secret = v;
        }
        if let Some(v) = var("MURMUR_NETWORK__WS_URL") {
            self.network.ws_url = v;
        }
        if let Some(v) = var("MURMUR_NETWORK__AUTH_URL") {
            self.network.auth_url = v;
        }
        if let Some(v) = var("MURMUR_NETWORK__RECONNECT_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.network.reconnect_interval_ms = ms;
            }
        }
        if let Some(v) = var("MURMUR_SPOOL__DIR") {
            self.spool.dir = PathBuf::from(v);
        }
        if let Some(v) = var("MURMUR_TRANSCODER__INPUT_PATH") {
            self.transcoder.input_path = PathBuf::from(v);
        }
    }
}

impl CollectorConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config: Self = load_file(&Self::file_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("MURMUR_COLLECTOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("collector.toml"))
    }

    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        write_default::<Self>(Self::file_path())
    }

    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MURMUR_COLLECTOR__BIND") {
            self.bind = v;
        }
        if let Some(v) = var("MURMUR_COLLECTOR__PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_backoff_is_fixed() {
        let net = NetworkConfig::default();
        assert_eq!(net.reconnect_interval(), net.max_reconnect_interval());
        assert_eq!(net.reconnect_interval(), Duration::from_secs(3));
    }

    #[test]
    fn max_interval_never_below_base() {
        let net = NetworkConfig {
            reconnect_interval_ms: 500,
            max_reconnect_interval_ms: 100,
            ..NetworkConfig::default()
        };
        assert_eq!(net.max_reconnect_interval(), Duration::from_millis(500));
    }

    #[test]
    fn env_overrides_replace_fields() {
        let env: HashMap<&str, &str> = [
            ("MURMUR_DEVICE__ID", "device-042"),
            ("MURMUR_NETWORK__RECONNECT_INTERVAL_MS", "250"),
            ("MURMUR_SPOOL__DIR", "/var/spool/murmur"),
        ]
        .into_iter()
        .collect();

        let mut config = UplinkConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.device.device_id, "device-042");
        assert_eq!(config.device.device_secret, "secret-001");
        assert_eq!(config.network.reconnect_interval_ms, 250);
        assert_eq!(config.spool.dir, PathBuf::from("/var/spool/murmur"));
    }

    #[test]
    fn unparseable_numeric_override_is_ignored() {
        let mut config = CollectorConfig::default();
        config.apply_env_overrides(|k| (k == "MURMUR_COLLECTOR__PORT").then(|| "nope".to_string()));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn transcoder_args_follow_reference_invocation() {
        let args = TranscoderConfig::default().args();
        assert_eq!(args.first().map(String::as_str), Some("-re"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        let codec = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[codec + 1], "libopus");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let text = "[network]\nws_url = \"ws://collector:9000/ingest\"\n";
        let config: UplinkConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.ws_url, "ws://collector:9000/ingest");
        assert_eq!(config.network.reconnect_interval_ms, 3000);
        assert_eq!(config.transcoder.read_chunk_bytes, 4096);
    }

    #[test]
    fn write_default_then_load_roundtrips() {
        let tmp = std::env::temp_dir().join(format!("murmur-config-test-{}", std::process::id()));
        let path = tmp.join("collector.toml");
        let _ = std::fs::remove_dir_all(&tmp);

        let written = write_default::<CollectorConfig>(path.clone()).unwrap();
        assert!(written.exists());

        let config: CollectorConfig = load_file(&path).unwrap();
        assert_eq!(config.devices, CollectorConfig::default().devices);
        assert_eq!(config.token_ttl_secs, 3600);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
