// Configuration loading and parsing (mixocracy.toml, credentials.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ledger::Address;
use crate::reconciler::ExhaustionPolicy;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub polling: PollingConfig,
    pub playback: PlaybackConfig,
    pub removal: RemovalConfig,
    pub spotify: SpotifyConfig,
    pub credentials: CredentialsConfig,
    pub ws_port: u16,
    pub db_path: String,
}

// ---------------------------------------------------------------------------
// mixocracy.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire mixocracy.toml file.
#[derive(Debug, Clone, Deserialize)]
struct MixocracyFile {
    ledger: LedgerConfig,
    polling: PollingConfig,
    playback: PlaybackConfig,
    removal: RemovalConfig,
    bridge: BridgeSection,
    database: DatabaseSection,
    spotify: SpotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeSection {
    ws_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub contract_address: Address,
    /// Local wallet: voter identity, and DJ identity when going live.
    pub account: Address,
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// DJ followed at startup. Can be changed at runtime.
    #[serde(default)]
    pub target: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    pub queue_interval_secs: u64,
    pub roster_interval_secs: u64,
    pub optimistic_max_polls: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    pub completion_tolerance_ms: u64,
    pub advance_debounce_ms: u64,
    pub play_grace_ms: u64,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemovalConfig {
    pub relay_url: String,
    pub inter_item_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub accounts_base: String,
    pub device_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Per-request HTTP timeout applied when a section leaves it unset.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub spotify_access_token: Option<String>,
    pub spotify_refresh_token: Option<String>,
}

impl CredentialsConfig {
    /// Treat blank entries (as left by the example template) as absent.
    fn normalized(self) -> Self {
        fn non_blank(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.trim().is_empty())
        }
        CredentialsConfig {
            spotify_access_token: non_blank(self.spotify_access_token),
            spotify_refresh_token: non_blank(self.spotify_refresh_token),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/mixocracy.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not auto-copy defaults; prefer `load_config()`.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- mixocracy.toml (required) ---
    let main_path = config_dir.join("mixocracy.toml");
    let main_text = read_file(&main_path)?;
    let file: MixocracyFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str::<CredentialsConfig>(&cred_text)
            .map_err(|e| ConfigError::ParseError {
                path: credentials_path.clone(),
                source: e,
            })?
            .normalized()
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        ledger: file.ledger,
        polling: file.polling,
        playback: file.playback,
        removal: file.removal,
        spotify: file.spotify,
        credentials,
        ws_port: file.bridge.ws_port,
        db_path: file.database.path,
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the crate root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Loads config relative to the current working directory, copying defaults
/// first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let urls: &[(&str, &str)] = &[
        ("ledger.rpc_url", &config.ledger.rpc_url),
        ("removal.relay_url", &config.removal.relay_url),
        ("spotify.api_base", &config.spotify.api_base),
        ("spotify.accounts_base", &config.spotify.accounts_base),
    ];
    for (name, url) in urls {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(name, format!("must be an http(s) URL, got `{url}`")));
        }
    }

    let positive: &[(&str, u64)] = &[
        ("ledger.receipt_timeout_secs", config.ledger.receipt_timeout_secs),
        ("ledger.request_timeout_secs", config.ledger.request_timeout_secs),
        ("removal.request_timeout_secs", config.removal.request_timeout_secs),
        ("spotify.request_timeout_secs", config.spotify.request_timeout_secs),
        ("polling.queue_interval_secs", config.polling.queue_interval_secs),
        ("polling.roster_interval_secs", config.polling.roster_interval_secs),
        (
            "polling.optimistic_max_polls",
            u64::from(config.polling.optimistic_max_polls),
        ),
        ("playback.advance_debounce_ms", config.playback.advance_debounce_ms),
    ];
    for (name, val) in positive {
        if *val == 0 {
            return Err(invalid(name, "must be > 0"));
        }
    }

    let tolerance = config.playback.completion_tolerance_ms;
    if !(500..=5000).contains(&tolerance) {
        return Err(invalid(
            "playback.completion_tolerance_ms",
            format!("must be between 500 and 5000, got {tolerance}"),
        ));
    }

    if config.ws_port == 0 {
        return Err(invalid("bridge.ws_port", "must be a non-zero port"));
    }

    if config.db_path.trim().is_empty() {
        return Err(invalid("database.path", "must not be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
