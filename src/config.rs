//! Layered configuration: compiled-in defaults, an optional TOML file,
//! environment variables (`GUACG_*`), and finally explicit CLI overrides
//! applied by `main`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct ServerConf {
    #[default(_code = "\"127.0.0.1\".to_string()")]
    pub bind_addr: String,

    #[default(6060)]
    pub port: u16,

    #[default(_code = "\"/ws\".to_string()")]
    pub endpoint: String,

    #[default(false)]
    pub serve_static: bool,

    #[default(false)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct GuacdConf {
    #[default(_code = "\"localhost\".to_string()")]
    pub host: String,

    #[default(4822)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct SessionConf {
    #[default(_code = "\"rdp\".to_string()")]
    pub default_protocol: String,

    #[default(1024)]
    pub default_width: u32,

    #[default(768)]
    pub default_height: u32,

    #[default(96)]
    pub default_dpi: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkingConf {
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ParkingConf {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Root configuration object, assembled by [`Conf::load`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub server: ServerConf,
    pub guacd: GuacdConf,
    pub session: SessionConf,
    pub parking: ParkingConf,
}

impl Conf {
    /// Loads configuration layered as: compiled-in defaults → optional
    /// TOML file at `config_path` → environment variables prefixed
    /// `GUACG_` (double underscore as the nesting separator, e.g.
    /// `GUACG_SERVER__PORT`).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if the file exists but fails to
    /// parse, or if the merged configuration doesn't match [`Conf`]'s
    /// shape.
    pub fn load(config_path: Option<&str>) -> Result<Self, BrokerError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path).required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GUACG").separator("__"),
        );

        let conf = builder.build()?.try_deserialize()?;
        Ok(conf)
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e)
    }
}
