use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::auth::AuthConfig;

/// Default configuration file, read when it exists
pub const DEFAULT_CONFIG_FILE: &str = "authgate.toml";

/// Prefix of configuration environment variables; `__` separates nested keys
pub const ENV_PREFIX: &str = "AUTHGATE_";

/// Configuration for the authgate server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file at `path` (if it
    /// exists), then `AUTHGATE_*` environment variables
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config: AppConfig = Self::figment(path.as_ref()).extract()?;
        config.auth.validate()?;
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDER_TOML: &str = r#"
        [auth]
        redirect_base_url = "https://drive.example.com"

        [auth.provider]
        client_id = "client-123"
        client_secret = "secret-456"
        issuer = "https://accounts.example.com"
    "#;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server_addr(), "0.0.0.0:4000");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.auth.session_ttl_seconds, 2_592_000);
    }

    #[test]
    fn test_load_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("authgate.toml", PROVIDER_TOML)?;
            jail.set_env("AUTHGATE_SERVER__PORT", "8080");
            jail.set_env("AUTHGATE_AUTH__SESSION_TTL_SECONDS", "3600");

            let config = AppConfig::load("authgate.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.server.port, 8080);
            assert_eq!(config.auth.session_ttl_seconds, 3600);
            assert_eq!(config.auth.provider.client_id, "client-123");
            assert_eq!(
                config.auth.callback_url(),
                "https://drive.example.com/auth/callback"
            );
            assert_eq!(config.auth.requested_scopes, vec!["openid", "email", "profile"]);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_env_only() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("AUTHGATE_AUTH__REDIRECT_BASE_URL", "http://localhost:4000");
            jail.set_env("AUTHGATE_AUTH__PROVIDER__CLIENT_ID", "client");
            jail.set_env("AUTHGATE_AUTH__PROVIDER__CLIENT_SECRET", "secret");
            jail.set_env("AUTHGATE_AUTH__PROVIDER__ISSUER", "https://accounts.example.com");

            let config = AppConfig::load("missing.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.auth.provider.issuer, "https://accounts.example.com");
            Ok(())
        });
    }

    #[test]
    fn test_zero_ttl_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("authgate.toml", PROVIDER_TOML)?;
            jail.set_env("AUTHGATE_AUTH__SESSION_TTL_SECONDS", "0");

            assert!(AppConfig::load("authgate.toml").is_err());
            Ok(())
        });
    }
}
