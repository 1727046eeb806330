//! Configuration loading, normalisation and validation.
//!
//! Settings come from a JSON file (default `./config.json`), then a few
//! `RELAY_*` environment variables override secrets and targets. After
//! parsing, [`Config::apply_fixes`] normalises legacy forms and
//! [`Config::ensure_device_id`] fills in a stable device id, persisted in
//! `{state_dir}/config.generated.json` so restarts keep the same device.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::crypto::RotationPolicy;
use crate::rehost::HostAllowlist;
use crate::ws::http_to_ws_scheme;

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// File (inside `state_dir`) holding generated settings.
pub const GENERATED_FILE: &str = "config.generated.json";

const DEVICE_ID_LEN: usize = 10;
const REDACTED: &str = "[REDACTED]";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable.
    #[error("could not read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
    /// Config file is not valid JSON for the schema.
    #[error("could not parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// JSON error.
        source: serde_json::Error,
    },
    /// Required setting is empty.
    #[error("no {0} specified")]
    Missing(&'static str),
    /// Numeric setting must be positive.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// Allowlist entry is not a valid regular expression.
    #[error("invalid allowed host pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// Offending pattern.
        pattern: String,
        /// Regex error.
        source: regex::Error,
    },
    /// Generated settings could not be stored.
    #[error("could not store generated settings in {path}: {source}")]
    Generated {
        /// File path.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
}

/// Gotify server connection.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct GotifyConfig {
    /// Server URL; http(s) is rewritten to ws(s).
    pub url: String,
    /// Client token.
    pub api_token: String,
}

/// Matrix account and target room.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MatrixConfig {
    /// Homeserver base URL.
    pub homeserver_url: String,
    /// Server name used to build the user id; defaults to the homeserver host.
    pub matrix_domain: String,
    /// Localpart (or full `@user:server` id).
    pub username: String,
    /// Password for `m.login.password`.
    pub password: String,
    /// Pre-issued access token, used instead of the password when set.
    pub token: String,
    /// Target room.
    pub room_id: String,
    /// Device id; generated and persisted when empty.
    pub device_id: String,
    /// Megolm-encrypt messages.
    pub encrypted: bool,
    /// Messages per group session.
    pub session_rotation_messages: u64,
    /// Maximum group session age in seconds.
    pub session_rotation_secs: u64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            matrix_domain: String::new(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
            room_id: String::new(),
            device_id: String::new(),
            encrypted: false,
            session_rotation_messages: constants::DEFAULT_ROTATION_MESSAGES,
            session_rotation_secs: constants::DEFAULT_ROTATION_SECS,
        }
    }
}

/// Log output.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace / debug / info / warn / error.
    pub level: String,
    /// plain / color / json.
    pub format: String,
}

/// Image download policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Host regexes; empty disables image re-hosting.
    pub allowed_hosts: Vec<String>,
    /// Per-image fetch timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            timeout_secs: constants::DEFAULT_IMAGE_FETCH_TIMEOUT_SECS,
        }
    }
}

/// Relay configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Gotify connection.
    pub gotify: GotifyConfig,
    /// Matrix connection.
    pub matrix: MatrixConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Deprecated: forces the debug log level.
    pub debug: bool,
    /// Image download policy.
    pub downloader: DownloaderConfig,
    /// Markdown template for plain-text notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,
    /// Directory for the crypto store and generated settings.
    pub state_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gotify: GotifyConfig::default(),
            matrix: MatrixConfig::default(),
            logging: LoggingConfig::default(),
            debug: false,
            downloader: DownloaderConfig::default(),
            template_path: None,
            state_dir: PathBuf::from("./state"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct GeneratedSettings {
    #[serde(default)]
    device_id: String,
}

impl Config {
    /// Load `path`, apply environment overrides, fixes and the device id.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides();
        config.apply_fixes();
        config.ensure_device_id()?;
        Ok(config)
    }

    /// Apply `RELAY_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("RELAY_GOTIFY_URL") {
            self.gotify.url = url;
        }
        if let Some(token) = var("RELAY_GOTIFY_TOKEN") {
            self.gotify.api_token = token;
        }
        if let Some(password) = var("RELAY_MATRIX_PASSWORD") {
            self.matrix.password = password;
        }
        if let Some(token) = var("RELAY_MATRIX_TOKEN") {
            self.matrix.token = token;
        }
        if let Some(room) = var("RELAY_ROOM_ID") {
            self.matrix.room_id = room;
        }
    }

    /// Normalise legacy and shorthand settings.
    pub fn apply_fixes(&mut self) {
        if self.matrix.matrix_domain.is_empty() {
            self.matrix.matrix_domain = self
                .matrix
                .homeserver_url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
        }

        if !self.gotify.url.is_empty() {
            self.gotify.url = http_to_ws_scheme(&self.gotify.url);
        }

        if self.debug {
            self.logging.level = "debug".to_string();
        }
        if self.logging.level.is_empty() {
            self.logging.level = "info".to_string();
        }
    }

    /// Fill in an empty device id from the generated settings file, or
    /// generate and store a new one.
    pub fn ensure_device_id(&mut self) -> Result<(), ConfigError> {
        if !self.matrix.device_id.is_empty() {
            return Ok(());
        }

        let path = self.state_dir.join(GENERATED_FILE);
        let stored = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str::<GeneratedSettings>(&content).ok())
            .map(|g| g.device_id)
            .filter(|id| !id.is_empty());

        if let Some(device_id) = stored {
            self.matrix.device_id = device_id;
            return Ok(());
        }

        let device_id = generate_device_id();
        log::info!("Generated device id {device_id}");
        store_generated(&path, &GeneratedSettings {
            device_id: device_id.clone(),
        })?;
        self.matrix.device_id = device_id;
        Ok(())
    }

    /// Check required settings. Logs a warning for deprecated keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.gotify.url, "gotify url"),
            (&self.gotify.api_token, "gotify api token"),
            (&self.matrix.homeserver_url, "matrix homeserver"),
            (&self.matrix.username, "matrix username"),
            (&self.matrix.room_id, "matrix room id"),
        ];
        for (value, name) in required {
            if value.is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        if self.matrix.password.is_empty() && self.matrix.token.is_empty() {
            return Err(ConfigError::Missing("matrix password or token"));
        }
        if self.matrix.session_rotation_messages == 0 {
            return Err(ConfigError::Zero("matrix session_rotation_messages"));
        }
        if self.matrix.session_rotation_secs == 0 {
            return Err(ConfigError::Zero("matrix session_rotation_secs"));
        }

        self.allowlist()?;

        if self.debug {
            log::warn!("Using deprecated key 'debug' in config. Please use logging.level instead");
        }
        Ok(())
    }

    /// Compiled image host allowlist.
    pub fn allowlist(&self) -> Result<HostAllowlist, ConfigError> {
        let patterns = self
            .downloader
            .allowed_hosts
            .iter()
            .map(|pattern| {
                regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HostAllowlist::from_patterns(patterns))
    }

    /// Full Matrix user id.
    pub fn user_id(&self) -> String {
        if self.matrix.username.starts_with('@') {
            self.matrix.username.clone()
        } else {
            format!("@{}:{}", self.matrix.username, self.matrix.matrix_domain)
        }
    }

    /// Group session rotation limits.
    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_messages: self.matrix.session_rotation_messages,
            max_age: Duration::from_secs(self.matrix.session_rotation_secs),
        }
    }

    /// Timeout for each image download.
    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.downloader.timeout_secs)
    }

    /// Copy with secrets replaced, for printing.
    pub fn redacted(&self) -> Self {
        fn redact(value: &mut String) {
            if !value.is_empty() {
                *value = REDACTED.to_string();
            }
        }
        let mut config = self.clone();
        redact(&mut config.gotify.api_token);
        redact(&mut config.matrix.password);
        redact(&mut config.matrix.token);
        config
    }
}

/// Ten random uppercase letters.
fn generate_device_id() -> String {
    let mut rng = rand::rng();
    (0..DEVICE_ID_LEN)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect()
}

fn store_generated(path: &Path, settings: &GeneratedSettings) -> Result<(), ConfigError> {
    let write = || -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
        fs::write(path, json)?;
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    };
    write().map_err(|source| ConfigError::Generated {
        path: path.to_path_buf(),
        source,
    })
}
