//! Configuration loading

use std::path::{Path, PathBuf};

use sendq_delivery::{DispatcherConfig, SenderConfig};
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SENDQ_CONFIG";

fn default_database() -> String {
    String::from("sqlite://sendq.db")
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("sendq.lock")
}

const fn default_retention_days() -> u32 {
    30
}

/// Retention used by `cleanup` when no explicit age is given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

/// Top-level configuration, read from a RON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sendq {
    /// sqlx SQLite URL of the queue database
    #[serde(default = "default_database")]
    pub database: String,

    /// Marker file guarding against a second dispatcher
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub sender: SenderConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl Default for Sendq {
    fn default() -> Self {
        Self {
            database: default_database(),
            lock_path: default_lock_path(),
            dispatcher: DispatcherConfig::default(),
            sender: SenderConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Sendq {
    /// Load the configuration, falling back to defaults when no file exists.
    ///
    /// # Errors
    ///
    /// If an explicitly requested file is missing or any file found fails to parse.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let env = std::env::var(CONFIG_ENV).ok();

        match find_config_file(explicit, env.as_deref(), &default_paths())? {
            Some(path) => Self::from_file(&path),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// # Errors
    ///
    /// If the file cannot be read or is not valid configuration.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {}", path.display(), e))
    }
}

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./sendq.config.ron"),
        PathBuf::from("/etc/sendq/sendq.config.ron"),
    ]
}

/// Find the configuration file using the following precedence:
/// 1. An explicit `--config` path
/// 2. `SENDQ_CONFIG` environment variable
/// 3. ./sendq.config.ron (current working directory)
/// 4. /etc/sendq/sendq.config.ron (system-wide config)
///
/// Explicitly named files must exist; the default locations are optional.
///
/// # Errors
///
/// If the explicit path or the environment variable names a missing file.
pub fn find_config_file(
    explicit: Option<&Path>,
    env: Option<&str>,
    defaults: &[PathBuf],
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(Some(path));
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    Ok(defaults.iter().find(|path| path.exists()).cloned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use sendq_delivery::RetryPolicy;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Sendq = ron::from_str("()").unwrap();
        assert_eq!(config, Sendq::default());
        assert_eq!(config.cleanup.retention_days, 30);
        assert_eq!(config.sender, SenderConfig::Log);
    }

    #[test]
    fn test_partial_config() {
        let config: Sendq = ron::from_str(
            r#"(
                database: "sqlite:///var/lib/sendq/queue.db",
                dispatcher: (
                    batch_size: 10,
                    max_runtime_secs: Some(3300),
                    retry: (max_retries: 3),
                ),
                sender: Sendmail(from: "noreply@example.com"),
            )"#,
        )
        .unwrap();

        assert_eq!(config.database, "sqlite:///var/lib/sendq/queue.db");
        assert_eq!(config.dispatcher.batch_size, 10);
        assert_eq!(config.dispatcher.idle_interval_secs, 30);
        assert_eq!(config.dispatcher.max_runtime_secs, Some(3300));
        assert_eq!(
            config.dispatcher.retry,
            RetryPolicy {
                max_retries: 3,
                ..RetryPolicy::default()
            }
        );
        assert_eq!(
            config.sender,
            SenderConfig::Sendmail {
                program: "/usr/sbin/sendmail".to_string(),
                args: vec!["-i".to_string()],
                from: "noreply@example.com".to_string(),
            }
        );
    }

    #[test]
    fn test_find_config_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.ron");
        let from_env = dir.path().join("env.ron");
        let fallback = dir.path().join("fallback.ron");
        for path in [&explicit, &from_env, &fallback] {
            std::fs::write(path, "()").unwrap();
        }
        let defaults = vec![dir.path().join("missing.ron"), fallback.clone()];

        assert_eq!(
            find_config_file(Some(explicit.as_path()), from_env.to_str(), &defaults).unwrap(),
            Some(explicit)
        );
        assert_eq!(
            find_config_file(None, from_env.to_str(), &defaults).unwrap(),
            Some(from_env)
        );
        assert_eq!(
            find_config_file(None, None, &defaults).unwrap(),
            Some(fallback)
        );
        assert_eq!(find_config_file(None, None, &[]).unwrap(), None);
    }

    #[test]
    fn test_missing_named_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.ron");

        assert!(find_config_file(Some(missing.as_path()), None, &[]).is_err());
        let error = find_config_file(None, missing.to_str(), &[]).unwrap_err();
        assert!(error.to_string().contains(CONFIG_ENV));
    }

    #[test]
    fn test_sample_config_parses() {
        let config: Sendq = ron::from_str(include_str!("../../sendq.config.ron")).unwrap();
        assert!(config.dispatcher.stale_after_secs > config.dispatcher.send_timeout_secs);
    }
}
