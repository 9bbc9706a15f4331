// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::options::RabbitMqOptions;

pub const CONFIG_FILE_NAME: &str = "RabbitMqMessaging.json";

/// On-disk layout: the options live under a `RabbitMq` section.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "RabbitMq", default)]
    pub rabbit_mq: RabbitMqOptions,
}

/// The first config file found in the current directory, `config/`, or the
/// user's home directory (as a dotfile).
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        (
            "Current directory (alternative)",
            Path::new("config").join(CONFIG_FILE_NAME),
        ),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    let home_config = home::home_dir()?.join(format!(".{}", CONFIG_FILE_NAME));
    if home_config.exists() {
        debug!("Found config file in home directory: {}", home_config.display());
        return Some(home_config);
    }

    None
}

pub fn load_options_from(path: &Path) -> Result<RabbitMqOptions> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let file: ConfigFile = serde_json::from_str(&content)
        .with_context(|| format!("Config file {} contains invalid JSON", path.display()))?;

    Ok(file.rabbit_mq)
}

/// Config file (or defaults), then environment overrides, then validation.
pub fn load_options() -> Result<RabbitMqOptions> {
    let mut options = match find_config_file() {
        Some(path) => load_options_from(&path)?,
        None => {
            debug!("No {} found; starting from defaults", CONFIG_FILE_NAME);
            RabbitMqOptions::default()
        }
    };

    apply_env_overrides(&mut options).context("Invalid RabbitMQ environment override")?;
    options.validate().context("Invalid RabbitMQ configuration")?;
    Ok(options)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&ConfigFile::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
