// Configuration loading and parsing (draft.toml).

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::draft::coordinator::DraftSettings;

/// File name looked up under `config/` and seeded from `defaults/`.
pub const CONFIG_FILE: &str = "draft.toml";

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

    #[error("failed to seed {path} from defaults: {message}")]
    SeedError { path: PathBuf, message: String },
}

// ---------------------------------------------------------------------------
// draft.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub draft: DraftConfig,
    pub websocket: WebsocketConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftConfig {
    /// Seconds a player has to pick before the auto-pick fires.
    pub turn_seconds: u64,
    /// Stocks every player must hold before the draft completes.
    pub picks_per_player: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn draft_settings(&self) -> DraftSettings {
        DraftSettings {
            turn_duration: Duration::from_secs(self.draft.turn_seconds),
            picks_per_player: self.draft.picks_per_player,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/draft.toml` relative to `base_dir`.
///
/// Does not seed a missing file; `load_config()` does that first.
pub(crate) fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = config_path(base_dir);
    let text = read_file(&path)?;
    let config = parse(&path, &text)?;
    validate(&config)?;
    Ok(config)
}

fn parse(path: &Path, text: &str) -> Result<Config, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// First-run setup: copy `defaults/draft.toml` to `config/draft.toml`.
/// Returns the seeded path, or `None` when a config is already in place.
pub fn seed_config(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = config_path(base_dir);
    if target.exists() {
        return Ok(None);
    }

    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let seed_error = |message: String| ConfigError::SeedError {
        path: target.clone(),
        message,
    };
    if !source.is_file() {
        return Err(seed_error(format!(
            "{} is missing; run from the project root",
            source.display()
        )));
    }

    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir).map_err(|e| seed_error(e.to_string()))?;
    }
    fs::copy(&source, &target).map_err(|e| seed_error(e.to_string()))?;
    Ok(Some(target))
}

/// Load config relative to the current working directory, seeding it from
/// `defaults/` on first run.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    seed_config(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join("config").join(CONFIG_FILE)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.draft.turn_seconds == 0 {
        return Err(ConfigError::ValidationError {
            field: "draft.turn_seconds".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.draft.picks_per_player == 0 {
        return Err(ConfigError::ValidationError {
            field: "draft.picks_per_player".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.websocket.port == 0 {
        return Err(ConfigError::ValidationError {
            field: "websocket.port".into(),
            message: "must be a fixed port, got 0".into(),
        });
    }

    if config.database.path.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
