//! Gateway configuration, read from the environment once at startup.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub redis_url: Option<String>,
    pub function_storage_dir: PathBuf,
    pub log_filter: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("cirrus.db"),
            redis_url: None,
            function_storage_dir: PathBuf::from("function-storage"),
            log_filter: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            db_path: std::env::var("DB_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            function_storage_dir: std::env::var("CIRRUS_FUNCTION_STORAGE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.function_storage_dir),
            log_filter: std::env::var("LOG_LEVEL")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }
}
