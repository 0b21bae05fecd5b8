//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `PROMPTGATE_BIND`, `PROMPTGATE_DB` and `PROMPTGATE_LOG_LEVEL`
//! env overrides. The vault secret comes from `PROMPTGATE_VAULT_KEY` only —
//! never from TOML.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::GatewayError;

/// Metrics rows older than this many days are purged at startup.
/// Retention shorter than this is clamped up by the caller.
pub const MIN_RETENTION_DAYS: u32 = 30;

/// Fully-resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address the HTTP listener binds to.
    pub bind: String,
    /// SQLite database path (already expanded, no `~`).
    pub database_path: PathBuf,
    pub log_level: String,
    /// Metric retention in days (`[metrics].retention_days`).
    pub retention_days: u32,
    /// Vault secret from `PROMPTGATE_VAULT_KEY` env — never TOML.
    pub vault_key: Option<String>,
}

/// Raw TOML shape — `serde` target before resolution.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    metrics: RawMetrics,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Deserialize)]
struct RawDatabase {
    #[serde(default = "default_db_path")]
    path: String,
}

#[derive(Deserialize)]
struct RawMetrics {
    #[serde(default = "default_retention_days")]
    retention_days: u32,
}

impl Default for RawServer {
    fn default() -> Self {
        Self { bind: default_bind(), log_level: default_log_level() }
    }
}

impl Default for RawDatabase {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for RawMetrics {
    fn default() -> Self {
        Self { retention_days: default_retention_days() }
    }
}

fn default_bind() -> String { "127.0.0.1:8787".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_db_path() -> String { "~/.promptgate/gateway.db".to_string() }
fn default_retention_days() -> u32 { 90 }

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<GatewayConfig, GatewayError> {
    let bind_override = env::var("PROMPTGATE_BIND").ok();
    let db_override = env::var("PROMPTGATE_DB").ok();
    let log_override = env::var("PROMPTGATE_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        bind_override.as_deref(),
        db_override.as_deref(),
        log_override.as_deref(),
        env::var("PROMPTGATE_VAULT_KEY").ok(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    bind_override: Option<&str>,
    db_override: Option<&str>,
    log_override: Option<&str>,
    vault_key: Option<String>,
) -> Result<GatewayConfig, GatewayError> {
    let parsed: RawConfig = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse error in {}: {e}", path.display())))?
    } else {
        RawConfig::default()
    };

    let bind = bind_override.unwrap_or(&parsed.server.bind).to_string();
    let log_level = log_override.unwrap_or(&parsed.server.log_level).to_string();
    let database_path = expand_home(db_override.unwrap_or(&parsed.database.path));

    Ok(GatewayConfig {
        bind,
        database_path,
        log_level,
        retention_days: parsed.metrics.retention_days,
        vault_key,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[server]
bind = "127.0.0.1:9000"
log_level = "debug"

[database]
path = "/tmp/promptgate-test.db"

[metrics]
retention_days = 45
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_basic_config() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None, None, None).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/promptgate-test.db"));
        assert_eq!(cfg.retention_days, 45);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = load_from(Path::new("/nonexistent/promptgate.toml"), None, None, None, None).unwrap();
        assert_eq!(cfg.bind, default_bind());
        assert_eq!(cfg.retention_days, default_retention_days());
    }

    #[test]
    fn overrides_take_precedence() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("0.0.0.0:80"), Some("/tmp/other.db"), Some("trace"), None).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:80");
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(cfg.log_level, "trace");
    }

    #[test]
    fn vault_key_comes_from_caller_not_toml() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None, None, Some("s3cret".into())).unwrap();
        assert_eq!(cfg.vault_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.promptgate/gateway.db");
        assert!(expanded.starts_with(&home));
    }

    #[test]
    fn absolute_path_unchanged() {
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn malformed_toml_errors() {
        let f = write_toml("[server\nbind=");
        let err = load_from(f.path(), None, None, None, None).unwrap_err();
        assert!(err.to_string().contains("config error"));
    }
}
