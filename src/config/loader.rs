use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, ConfigError};

use super::types::FleetConfig;

const DEFAULT_TOML: &str = "fleetbench.toml";
const DEFAULT_JSON: &str = "fleetbench.json";

/// Loads and validates the fleet configuration from `path`, or from
/// `fleetbench.toml` / `fleetbench.json` in the working directory. Falls back
/// to defaults when no file is found.
///
/// # Errors
///
/// Returns an error when the config file cannot be read, parsed or
/// validated.
pub fn load_config(path: Option<&str>) -> AppResult<FleetConfig> {
    let config = match path {
        Some(path) => load_config_file(&PathBuf::from(path))?,
        None => match [DEFAULT_TOML, DEFAULT_JSON]
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists())
        {
            Some(found) => load_config_file(&found)?,
            None => FleetConfig::default(),
        },
    };
    config.validate()?;
    Ok(config)
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<FleetConfig> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        AppError::config(ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source: err,
        })
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|err| {
            AppError::config(ConfigError::ParseToml {
                path: path.to_path_buf(),
                source: err,
            })
        }),
        Some("json") => serde_json::from_str(&content).map_err(|err| {
            AppError::config(ConfigError::ParseJson {
                path: path.to_path_buf(),
                source: err,
            })
        }),
        Some(ext) => Err(AppError::config(ConfigError::UnsupportedExtension {
            ext: ext.to_owned(),
        })),
        None => Err(AppError::config(ConfigError::MissingExtension)),
    }
}
