//! Configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed `MODBUSSRV_` (nested keys split on `__`)
//! 2. Configuration file (YAML or TOML, chosen by extension)
//! 3. Built-in defaults

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use ladder_modbus::ModbusConfig;
use tracing::debug;

use crate::error::{Result, SrvError};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MODBUSSRV_";

/// Figment holding every configuration source
pub fn figment(path: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(ModbusConfig::default()));

    if let Some(path) = path {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SrvError::config("Config file must have an extension"))?;
        if !path.exists() {
            return Err(SrvError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        figment = match extension {
            "toml" => figment.merge(Toml::file(path)),
            "yaml" | "yml" => figment.merge(Yaml::file(path)),
            _ => {
                return Err(SrvError::config(format!(
                    "Unsupported config file format: {}",
                    extension
                )))
            },
        };
    }

    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Load and validate the configuration
pub fn load_config(path: Option<&Path>) -> Result<ModbusConfig> {
    let config: ModbusConfig = figment(path)?
        .extract()
        .map_err(|e| SrvError::config(format!("Failed to load configuration: {}", e)))?;
    config.validate()?;

    debug!(
        "Configuration loaded: {:?} mode, {} request slot(s)",
        config.framing_mode(),
        config.requests.len()
    );
    Ok(config)
}
