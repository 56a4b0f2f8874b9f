use std::path::Path;

use crate::config::types::EtlConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] dimload_utils::error::Error),
}

/// Load, override from the environment and validate a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<EtlConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config = parse_config(&content)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Parse a config from a YAML string. Does not validate.
pub fn parse_config(yaml: &str) -> Result<EtlConfig, ConfigError> {
    let config: EtlConfig = serde_yaml::from_str(yaml)?;
    Ok(config)
}
