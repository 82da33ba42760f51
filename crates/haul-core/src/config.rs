use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::MigrateError;
use crate::reconcile::{DEFAULT_BATCH_SIZE, DEFAULT_MIGRATION_VERSION};
use crate::store::validate_database_name;

/// Name of the optional config file at the project root.
pub const CONFIG_FILE: &str = "haul.toml";

pub const ENV_TARGET_URI: &str = "HAUL_TARGET_URI";
pub const ENV_DATABASE: &str = "HAUL_DATABASE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_target_uri")]
    pub uri: String,
    #[serde(default = "default_database")]
    pub database: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            uri: default_target_uri(),
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            version: default_version(),
        }
    }
}

/// Fully resolved settings for one run. Paths are resolved against `root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrateConfig {
    pub root: PathBuf,
    pub source_path: PathBuf,
    pub backup_dir: PathBuf,
    pub log_dir: PathBuf,
    pub target_uri: String,
    pub database: String,
    pub batch_size: usize,
    pub version: String,
}

impl MigrateConfig {
    /// Built-in defaults for a project rooted at `root`, ignoring the config
    /// file and environment.
    #[must_use]
    pub fn defaults(root: &Path) -> Self {
        Self::from_file(root, FileConfig::default())
    }

    fn from_file(root: &Path, file: FileConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            source_path: root.join(file.source.path),
            backup_dir: root.join(file.backup.dir),
            log_dir: root.join(file.log.dir),
            target_uri: file.target.uri,
            database: file.target.database,
            batch_size: file.migration.batch_size,
            version: file.migration.version,
        }
    }

    /// Reject settings no run can use.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidConfig`] naming the offending setting.
    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.batch_size == 0 {
            return Err(MigrateError::InvalidConfig(
                "migration.batch_size must be at least 1".into(),
            ));
        }
        validate_database_name(&self.database)
            .map_err(|reason| MigrateError::InvalidConfig(format!("target.database: {reason}")))?;
        if self.version.trim().is_empty() {
            return Err(MigrateError::InvalidConfig("migration.version must not be empty".into()));
        }
        Ok(())
    }
}

/// Read `<root>/haul.toml`, or defaults when it does not exist.
///
/// # Errors
///
/// Returns [`MigrateError::InvalidConfig`] if the file exists but cannot be
/// read or parsed.
pub fn load_file_config(root: &Path) -> Result<FileConfig, MigrateError> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(FileConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|err| MigrateError::InvalidConfig(format!("failed to read {}: {err}", path.display())))?;

    toml::from_str::<FileConfig>(&content)
        .map_err(|err| MigrateError::InvalidConfig(format!("failed to parse {}: {err}", path.display())))
}

/// Resolve the run configuration: defaults, then `haul.toml`, then
/// `HAUL_TARGET_URI` / `HAUL_DATABASE`.
///
/// # Errors
///
/// Returns [`MigrateError::InvalidConfig`] for an unreadable config file or
/// invalid settings.
pub fn resolve_config(root: &Path) -> Result<MigrateConfig, MigrateError> {
    resolve_with_env(
        root,
        env::var(ENV_TARGET_URI).ok(),
        env::var(ENV_DATABASE).ok(),
    )
}

fn resolve_with_env(
    root: &Path,
    env_target_uri: Option<String>,
    env_database: Option<String>,
) -> Result<MigrateConfig, MigrateError> {
    let mut config = MigrateConfig::from_file(root, load_file_config(root)?);

    if let Some(uri) = env_target_uri.filter(|v| !v.trim().is_empty()) {
        config.target_uri = uri;
    }
    if let Some(database) = env_database.filter(|v| !v.trim().is_empty()) {
        config.database = database;
    }

    config.validate()?;
    Ok(config)
}

fn default_source_path() -> PathBuf {
    PathBuf::from("data/db.json")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("data/backups")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_target_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "waste_management".to_string()
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_version() -> String {
    DEFAULT_MIGRATION_VERSION.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_uses_defaults() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = resolve_with_env(root.path(), None, None).expect("resolve");

        assert_eq!(cfg.source_path, root.path().join("data/db.json"));
        assert_eq!(cfg.backup_dir, root.path().join("data/backups"));
        assert_eq!(cfg.log_dir, root.path().join("logs"));
        assert_eq!(cfg.target_uri, "mongodb://localhost:27017");
        assert_eq!(cfg.database, "waste_management");
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.version, "2.0");
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            root.path().join(CONFIG_FILE),
            r#"
[source]
path = "snapshots/fleet.json"

[target]
uri = "memory://"
database = "from_file"

[migration]
batch_size = 250
"#,
        )
        .expect("write config");

        let file_only = resolve_with_env(root.path(), None, None).expect("resolve");
        assert_eq!(file_only.source_path, root.path().join("snapshots/fleet.json"));
        assert_eq!(file_only.target_uri, "memory://");
        assert_eq!(file_only.database, "from_file");
        assert_eq!(file_only.batch_size, 250);
        assert_eq!(file_only.log_dir, root.path().join("logs"));

        let with_env = resolve_with_env(
            root.path(),
            Some("sqlite:///var/lib/haul".into()),
            Some("from_env".into()),
        )
        .expect("resolve");
        assert_eq!(with_env.target_uri, "sqlite:///var/lib/haul");
        assert_eq!(with_env.database, "from_env");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = resolve_with_env(root.path(), Some("  ".into()), Some(String::new()))
            .expect("resolve");
        assert_eq!(cfg.target_uri, "mongodb://localhost:27017");
        assert_eq!(cfg.database, "waste_management");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join(CONFIG_FILE), "[migration]\nbatch_size = 0\n")
            .expect("write config");

        let err = resolve_with_env(root.path(), None, None).expect_err("must fail");
        assert!(matches!(err, MigrateError::InvalidConfig(_)));
    }

    #[test]
    fn database_name_with_path_separators_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");

        for bad in ["../../x", "nested/db", "with.dot"] {
            let err = resolve_with_env(root.path(), None, Some(bad.into())).expect_err("must fail");
            assert!(
                matches!(&err, MigrateError::InvalidConfig(msg) if msg.starts_with("target.database")),
                "{bad:?}: {err}"
            );
        }
    }

    #[test]
    fn malformed_config_file_is_invalid_config() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::write(root.path().join(CONFIG_FILE), "[target\nuri=").expect("write config");

        let err = resolve_with_env(root.path(), None, None).expect_err("must fail");
        assert!(err.to_string().contains("failed to parse"));
    }
}
