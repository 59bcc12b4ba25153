//! telebus_config
//!
//! Layered configuration, lowest precedence first:
//! 1. built-in defaults (`Settings::default`)
//! 2. an optional TOML/YAML/JSON file (`config/default.*` unless told otherwise)
//! 3. `TELEBUS__SECTION__FIELD` environment variables
//!
//! Sources are read into `PartialSettings` and merged over the defaults, so a
//! file or environment only has to name what it changes.

pub mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{
    BrokerSettings, ClientSettings, ClientTlsSettings, LogSettings, ServerSettings,
    ServerTlsSettings, Settings, TrustSettings, WalSettings,
};

pub const DEFAULT_CONFIG_FILE: &str = "config/default";
pub const ENV_PREFIX: &str = "TELEBUS";

pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Like [`load_config`] with an explicit file (extension optional).
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(Settings::default().merge(partial))
}
