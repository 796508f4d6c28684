use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{PulseError, Result},
    session::AuthPolicy,
};

pub const DEFAULT_PORT: u16 = 5600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub auth: AuthPolicy,
    #[serde(default)]
    pub testing: bool,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// Client dispatcher tuning shared through the same config file so a
/// watcher process and the server read one source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub flush_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 200,
            send_timeout_ms: 5_000,
            max_attempts: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            auth: AuthPolicy::default(),
            testing: false,
            dispatch: DispatchSettings::default(),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PulseError::Config("unable to locate user home directory".to_string()))?;
    Ok(home.join(".pulsedb").join("config.toml"))
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_data_dir() -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(".pulsedb");
    };
    home.join(".pulsedb")
}
