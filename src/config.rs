//! Bootstrap configuration module
//!
//! Loaded once at startup from the CLI and environment, used only to seed the
//! store on first run. Everything reloadable at runtime lives in the
//! `ConfigRegistry` instead.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Reverse proxy for a generative-AI HTTP API")]
pub struct Args {
    /// Path to a .env file to load before reading the environment
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Override DATABASE_URL
    #[arg(long)]
    pub database_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "sqlite://data.db".to_string()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

/// Bootstrap configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Comma-separated list of keys clients must present to reach `/v1beta/*`.
    pub access_key: Option<String>,

    /// Password for the admin login flow.
    pub admin_key: Option<String>,

    /// Comma-separated seed list of upstream credentials, inserted on first boot.
    pub google_api_keys: Option<String>,

    pub database_url: String,
    pub gemini_api_base_url: String,
    pub host: String,
    pub port: u16,
    pub environment: String,
}

impl BootstrapConfig {
    /// Load from `args`' optional `.env` file, then process environment.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        if let Some(path) = &args.env_file {
            dotenvy::from_path(path).ok();
        } else {
            dotenvy::dotenv().ok();
        }

        fn env(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        let mut config = BootstrapConfig {
            access_key: env("ACCESS_KEY"),
            admin_key: env("ADMIN_KEY"),
            google_api_keys: env("GOOGLE_API_KEYS"),
            database_url: env("DATABASE_URL").unwrap_or_else(default_database_url),
            gemini_api_base_url: env("GEMINI_API_BASE_URL").unwrap_or_else(default_base_url),
            host: env("HOST").unwrap_or_else(default_host),
            port: env("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(default_port),
            environment: env("ENVIRONMENT").unwrap_or_else(default_environment),
        };

        if let Some(url) = &args.database_url {
            config.database_url = url.clone();
        }

        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Seed credential list, comma-split and trimmed, empty entries dropped.
    pub fn seed_credentials(&self) -> Vec<String> {
        split_trimmed(self.google_api_keys.as_deref())
    }
}

fn split_trimmed(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_trims_comma_list() {
        assert_eq!(
            split_trimmed(Some(" a, b ,,c")),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn empty_seed_yields_empty_vec() {
        assert!(split_trimmed(None).is_empty());
        assert!(split_trimmed(Some("")).is_empty());
    }

    #[test]
    fn is_production_is_case_insensitive() {
        let mut cfg = BootstrapConfig {
            access_key: None,
            admin_key: None,
            google_api_keys: None,
            database_url: default_database_url(),
            gemini_api_base_url: default_base_url(),
            host: default_host(),
            port: default_port(),
            environment: "Production".to_string(),
        };
        assert!(cfg.is_production());
        cfg.environment = "development".to_string();
        assert!(!cfg.is_production());
    }
}
