//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/cortex/config.toml` (user config)
//! 2. `./cortex.toml` (project-local)
//! 3. Explicit overrides from the embedding application (handled externally)

use std::path::{Path, PathBuf};

use crate::{ConfigError, CortexConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "cortex.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for platform directory resolution.
const APP_NAME: &str = "cortex";

/// Environment variable to override the config directory.
const CONFIG_DIR_ENV: &str = "CORTEX_CONFIG_DIR";

/// Environment variable to override the data directory holding the store file.
const DATA_DIR_ENV: &str = "CORTEX_DATA_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    /// Path to the config file.
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: CortexConfig,
    /// Sources that were checked, in order of precedence (lowest first).
    pub sources: Vec<ConfigSource>,
    /// Warnings generated during loading (e.g., a malformed layer that was skipped).
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Get paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }

    /// Resolve the store file path for this configuration.
    pub fn database_path(&self) -> Result<PathBuf> {
        resolve_database_path(&self.config)
    }
}

/// Load configuration by discovering and merging all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Load configuration with explicit control over the user config directory.
///
/// `config_dir` overrides both `CORTEX_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = CortexConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<CortexConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    CortexConfig::from_toml(&contents)
}

/// Save configuration to a file, creating parent directories as needed.
pub fn save_config(config: &CortexConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Path of the user config file (`<config dir>/config.toml`).
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// User config directory.
///
/// Checks `CORTEX_CONFIG_DIR` first, then falls back to the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    env_dir(CONFIG_DIR_ENV).or_else(|| dirs::config_dir().map(|d| d.join(APP_NAME)))
}

/// Data directory holding the store file.
///
/// Checks `CORTEX_DATA_DIR` first, then falls back to the platform default.
pub fn data_dir() -> Result<PathBuf> {
    env_dir(DATA_DIR_ENV)
        .or_else(|| dirs::data_dir().map(|d| d.join(APP_NAME)))
        .ok_or(ConfigError::NoDataDir)
}

/// Resolve the store file path: `[brain].database` if absolute, else relative to [`data_dir`].
pub fn resolve_database_path(config: &CortexConfig) -> Result<PathBuf> {
    let brain = config.brain();
    if let Some(ref p) = brain.database
        && p.is_absolute()
    {
        return Ok(p.clone());
    }
    Ok(brain.database_path(&data_dir()?))
}

fn env_dir(var: &str) -> Option<PathBuf> {
    match std::env::var(var) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => None,
    }
}

/// Try to load a config file and merge it into the existing config.
///
/// A missing file is skipped silently; a malformed one is skipped with a warning.
fn load_layer(config: &mut CortexConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    use crate::LinkPolicyKind;

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[brain]
write_retries = 4
"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.brain().write_retries, 4);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let err = load_config_file(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_no_files() {
        let dir = TempDir::new().unwrap();
        let empty_config_dir = TempDir::new().unwrap();
        let loaded =
            load_config_with_options(Some(dir.path()), Some(empty_config_dir.path())).unwrap();
        assert!(loaded.config.brain.is_none());
        assert!(loaded.loaded_from().is_empty());
    }

    #[test]
    fn test_load_config_layered_merge() {
        let user_dir = TempDir::new().unwrap();
        let project_dir = TempDir::new().unwrap();

        fs::write(
            user_dir.path().join("config.toml"),
            r#"
[brain]
write_retries = 2

[links]
policy = "consequence_similarity"
"#,
        )
        .unwrap();
        fs::write(
            project_dir.path().join("cortex.toml"),
            r#"
[brain]
write_retries = 6
"#,
        )
        .unwrap();

        let loaded =
            load_config_with_options(Some(project_dir.path()), Some(user_dir.path())).unwrap();

        // Project-local overrides the user layer
        assert_eq!(loaded.config.brain().write_retries, 6);
        // Sections the project layer doesn't touch are preserved
        assert_eq!(
            loaded.config.links().policy,
            LinkPolicyKind::ConsequenceSimilarity
        );
        assert_eq!(loaded.loaded_from().len(), 2);
    }

    #[test]
    fn test_malformed_config_warns_but_continues() {
        let dir = TempDir::new().unwrap();
        let empty_config_dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cortex.toml"), "not valid toml {{{{").unwrap();

        let loaded =
            load_config_with_options(Some(dir.path()), Some(empty_config_dir.path())).unwrap();
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].contains("Failed to load"));
        assert!(loaded.loaded_from().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CortexConfig::new();
        config.brain = Some(crate::BrainConfig {
            working_memory_capacity: 4,
            ..Default::default()
        });
        save_config(&config, &path).unwrap();

        let reloaded = load_config_file(&path).unwrap();
        assert_eq!(reloaded.brain().working_memory_capacity, 4);
    }

    #[test]
    #[serial]
    fn test_config_dir_env_override() {
        let dir = TempDir::new().unwrap();
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var(CONFIG_DIR_ENV, dir.path()) };
        let path = user_config_path();
        unsafe { std::env::remove_var(CONFIG_DIR_ENV) };

        assert_eq!(path, Some(dir.path().join("config.toml")));
    }

    #[test]
    #[serial]
    fn test_database_path_uses_data_dir_env() {
        let dir = TempDir::new().unwrap();
        // SAFETY: serialized with other env-mutating tests.
        unsafe { std::env::set_var(DATA_DIR_ENV, dir.path()) };
        let default_path = resolve_database_path(&CortexConfig::new());
        let relative = CortexConfig::from_toml("[brain]\ndatabase = \"team.db\"\n").unwrap();
        let relative_path = resolve_database_path(&relative);
        unsafe { std::env::remove_var(DATA_DIR_ENV) };

        assert_eq!(default_path.unwrap(), dir.path().join("brain.db"));
        assert_eq!(relative_path.unwrap(), dir.path().join("team.db"));
    }
}
