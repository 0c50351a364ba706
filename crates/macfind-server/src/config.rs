use std::path::PathBuf;

use thiserror::Error;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

const DEFAULT_EMAIL_DOMAIN: &str = "mcmaster.ca";
const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MACFIND_JWT_SECRET is unset or still a placeholder")]
    PlaceholderSecret,

    #[error("invalid {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Base URL this server is reachable at; object URLs are built from it.
    pub public_url: String,
    /// Web client origin, used in magic links.
    pub site_url: String,
    pub email_domain: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = get("MACFIND_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let port: u16 = match get("MACFIND_PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "MACFIND_PORT",
                value: raw.clone(),
            })?,
            None => 3001,
        };

        Ok(Self {
            jwt_secret,
            db_path: get("MACFIND_DB_PATH").unwrap_or_else(|| "macfind.db".into()).into(),
            host: get("MACFIND_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            storage_dir: get("MACFIND_STORAGE_DIR")
                .unwrap_or_else(|| "./storage".into())
                .into(),
            public_url: get("MACFIND_PUBLIC_URL")
                .unwrap_or_else(|| format!("http://localhost:{}", port)),
            site_url: get("MACFIND_SITE_URL").unwrap_or_else(|| "http://localhost:5173".into()),
            email_domain: get("MACFIND_EMAIL_DOMAIN").unwrap_or_else(|| DEFAULT_EMAIL_DOMAIN.into()),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn placeholder_secrets_are_fatal() {
        assert_eq!(Config::from_lookup(lookup(&[])).unwrap_err(), ConfigError::PlaceholderSecret);
        assert_eq!(
            Config::from_lookup(lookup(&[("MACFIND_JWT_SECRET", "dev-secret-change-me")])).unwrap_err(),
            ConfigError::PlaceholderSecret
        );
    }

    #[test]
    fn defaults_fill_the_rest() {
        let config = Config::from_lookup(lookup(&[
            ("MACFIND_JWT_SECRET", "a-real-secret"),
            ("MACFIND_PORT", "8080"),
            ("GEMINI_API_KEY", "  "),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.public_url, "http://localhost:8080");
        assert_eq!(config.email_domain, "mcmaster.ca");
        assert_eq!(config.gemini_model, "gemini-1.5-flash");
        assert_eq!(config.gemini_api_key, None);
    }

    #[test]
    fn bad_port_is_reported() {
        let err = Config::from_lookup(lookup(&[
            ("MACFIND_JWT_SECRET", "a-real-secret"),
            ("MACFIND_PORT", "http"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MACFIND_PORT", .. }));
    }
}
