//! Configuration loading and representation.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. optional `fleetshop.toml` in the working directory
//! 3. `FLEETSHOP__*` environment variables (`.env` is loaded first), with `__`
//!    separating nested keys, e.g. `FLEETSHOP__DATABASE__URL`.

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::Deserialize;

use fleetshop_observability::ObservabilityConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub log: ObservabilityConfig,
}

/// Ledger persistence. Without a `url` the in-memory store is used.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Self::from_builder(
            Config::builder()
                .add_source(File::with_name("fleetshop").required(false))
                .add_source(Environment::with_prefix("FLEETSHOP").separator("__")),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use fleetshop_observability::LogFormat;

    #[test]
    fn empty_sources_give_defaults() {
        let config = AppConfig::from_builder(Config::builder()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let toml = r#"
            [database]
            url = "postgres://shop@localhost/fleetshop"

            [log]
            format = "pretty"
        "#;
        let config =
            AppConfig::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
                .unwrap();

        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://shop@localhost/fleetshop")
        );
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.log.filter, "info");
    }
}
