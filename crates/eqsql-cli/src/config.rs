//! Configuration file management for the eqsql CLI.
//!
//! Provides a TOML-based config file at `~/.config/eqsql/config.toml` and a
//! resolution chain: CLI flag > `DB_*` env vars > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use eqsql_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    pub db_name: String,
}

impl DatabaseSection {
    pub fn to_db_config(&self) -> DbConfig {
        DbConfig::new(
            self.host.clone(),
            self.port,
            self.user.clone(),
            self.password.clone(),
            self.db_name.clone(),
        )
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the eqsql config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/eqsql` or `~/.config/eqsql`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("eqsql");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("eqsql")
}

/// Return the path to the eqsql config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (it may hold a password).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Resolve the database configuration.
///
/// Priority: explicit CLI overrides, then the `DB_*` environment
/// variables, then the config file, then the built-in local defaults.
pub fn resolve_db_config(
    cli_host: Option<&str>,
    cli_port: Option<u16>,
    cli_user: Option<&str>,
    cli_db_name: Option<&str>,
) -> DbConfig {
    let mut config = match load_config() {
        Ok(file) => file.database.to_db_config(),
        // No config file: DbConfig::from_env covers env vars + defaults.
        Err(_) => DbConfig::from_env(),
    };

    if let Some(host) = cli_host {
        config.host = host.to_owned();
    }
    if let Some(port) = cli_port {
        config.port = port;
    }
    if let Some(user) = cli_user {
        config.user = user.to_owned();
    }
    if let Some(db_name) = cli_db_name {
        config.db_name = db_name.to_owned();
    }
    config
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                host: "dbhost".to_owned(),
                port: 5433,
                user: "eqsql_user".to_owned(),
                password: None,
                db_name: "EQ_SQL".to_owned(),
            },
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();

        assert_eq!(loaded.database.host, "dbhost");
        assert_eq!(loaded.database.port, 5433);
        assert_eq!(loaded.database.user, "eqsql_user");
        assert_eq!(loaded.database.password, None);
        assert_eq!(loaded.database.db_name, "EQ_SQL");
    }

    #[test]
    fn database_section_to_db_config() {
        let section = DatabaseSection {
            host: "h".to_owned(),
            port: 5432,
            user: "u".to_owned(),
            password: Some("p".to_owned()),
            db_name: "d".to_owned(),
        };
        let config = section.to_db_config();
        assert_eq!(config.url(), "postgresql://u:p@h:5432/d");
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("eqsql/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
