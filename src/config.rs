use crate::geometry::DisplayProjection;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// `sqlite://path.db`, `sqlite::memory:` or `memory://`
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://measurements.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base: String,
    pub display_projection: DisplayProjection,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:3000/api".to_string(),
            display_projection: DisplayProjection::WebMercator,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Load the file if one is given (defaults otherwise), then apply the
    /// `PORT`, `DATABASE_URL` and `MEASURE_API_URL` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port:?}"))?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.url = url;
        }
        if let Some(api) = lookup("MEASURE_API_URL") {
            self.client.api_base = api;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 8081

            [client]
            display_projection = "EPSG:4326"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.store.url, "sqlite://measurements.db");
        assert_eq!(config.client.display_projection, DisplayProjection::Geographic);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [("PORT", "9000"), ("DATABASE_URL", "memory://")].into();
        let mut config = AppConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.url, "memory://");
        assert_eq!(config.client.api_base, "http://127.0.0.1:3000/api");
    }

    #[test]
    fn rejects_bad_port() {
        let mut config = AppConfig::default();
        assert!(config
            .apply_env(|k| (k == "PORT").then(|| "eighty".to_string()))
            .is_err());
    }
}
