//! Configuration for stepwise.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STEPWISE_HOME, STEPWISE_DB)
//! 2. Config file (.stepwise/config.yaml)
//! 3. Defaults (~/.stepwise, ~/.stepwise/runs.db)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stepwise/config.yaml
//! - Paths in config file are relative to the .stepwise/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{RetryConfig, RetryPreset};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".stepwise";
const CONFIG_FILE: &str = "config.yaml";
const DEFAULT_DATABASE: &str = "runs.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetrySettingsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .stepwise/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file (relative to .stepwise/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySettingsConfig {
    /// Preset used when a caller supplies no retry config
    pub default_preset: Option<String>,
    /// Overrides the preset's max_attempts
    pub max_attempts: Option<u32>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite run database
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry_preset: RetryPreset,
    pub retry_max_attempts: Option<u32>,
}

impl ResolvedConfig {
    /// Retry config applied when an execution request carries none
    pub fn default_retry_config(&self) -> RetryConfig {
        let mut config = self.retry_preset.config();
        if let Some(max_attempts) = self.retry_max_attempts {
            config.max_attempts = max_attempts;
        }
        config
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve configuration starting the file search at `start`, reading
/// environment variables through `env`
fn resolve_config<F>(start: &Path, default_home: PathBuf, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = find_config_file(start);
    let config = config_file
        .as_deref()
        .map(load_config_file)
        .transpose()?;

    // Paths in the file are relative to .stepwise/
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env("STEPWISE_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home_path) = config.as_ref().and_then(|c| c.paths.home.as_deref()) {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env("STEPWISE_DB") {
        PathBuf::from(env_db)
    } else if let Some(db_path) = config.as_ref().and_then(|c| c.storage.database.as_deref()) {
        resolve_path(config_dir, db_path)
    } else {
        home.join(DEFAULT_DATABASE)
    };

    let retry = config.map(|c| c.retry).unwrap_or_default();
    let retry_preset = retry
        .default_preset
        .as_deref()
        .map(RetryPreset::from_name)
        .unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        retry_preset,
        retry_max_attempts: retry.max_attempts,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    resolve_config(&cwd, default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the stepwise home directory (engine state)
pub fn stepwise_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the run database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", content).unwrap();
        path
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let home = PathBuf::from("/home/test/.stepwise");

        let config = resolve_config(temp.path(), home.clone(), no_env).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.database, home.join("runs.db"));
        assert!(config.config_file.is_none());
        assert_eq!(config.retry_preset, RetryPreset::Standard);
        assert_eq!(config.default_retry_config(), RetryPreset::Standard.config());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
storage:
  database: /var/lib/stepwise/runs.db
retry:
  default_preset: external
  max_attempts: 2
"#,
        );

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.home, Some("./state".to_string()));
        assert_eq!(config.retry.default_preset, Some("external".to_string()));
    }

    #[test]
    fn test_file_discovered_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            r#"
version: "1.0"
storage:
  database: /var/lib/stepwise/runs.db
retry:
  default_preset: external
  max_attempts: 2
"#,
        );
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let config = resolve_config(&nested, PathBuf::from("/unused"), no_env).unwrap();

        assert!(config.config_file.is_some());
        assert_eq!(config.database, PathBuf::from("/var/lib/stepwise/runs.db"));
        assert_eq!(config.retry_preset, RetryPreset::External);
        let retry = config.default_retry_config();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.initial_delay_ms, RetryPreset::External.config().initial_delay_ms);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        write_config(
            temp.path(),
            "version: \"1.0\"\npaths:\n  home: ./state\nstorage:\n  database: runs.db",
        );
        let env: HashMap<&str, &str> = [
            ("STEPWISE_HOME", "/env/home"),
            ("STEPWISE_DB", "/env/runs.db"),
        ]
        .into_iter()
        .collect();

        let config = resolve_config(temp.path(), PathBuf::from("/unused"), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/env/home"));
        assert_eq!(config.database, PathBuf::from("/env/runs.db"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.stepwise");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/.stepwise/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
