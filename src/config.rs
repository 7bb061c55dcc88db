// ABOUTME: TOML configuration for store connection, retry policy and realtime timing
// ABOUTME: Loads ~/.seafarm-sync/config.toml, falling back to defaults when absent

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mutation::RetryPolicy;
use crate::supabase::SupabaseSettings;
use crate::utils::{validate_project_url, validate_table_name};

pub const CONFIG_DIR: &str = ".seafarm-sync";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub store: StoreSection,
    pub retry: RetrySection,
    pub realtime: RealtimeSection,
    /// Tables `watch` follows when none are given on the command line
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub schema: String,
    pub request_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            schema: "public".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub heartbeat_secs: u64,
    pub join_timeout_secs: u64,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            join_timeout_secs: 10,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home_dir =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home_dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

impl SyncConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(contents).context("Failed to parse sync configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                bail!("Config file {} does not exist", path.display());
            }
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.realtime.heartbeat_secs == 0 {
            bail!("realtime.heartbeat_secs must be at least 1");
        }
        if let Some(url) = &self.store.url {
            validate_project_url(url).context("Invalid store.url")?;
        }
        for table in &self.tables {
            validate_table_name(table)?;
        }
        Ok(())
    }

    /// Resolves connection settings. Explicit values (flags or environment)
    /// win over the file; `fallback_url` is the persisted project URL.
    pub fn supabase_settings(
        &self,
        url: Option<&str>,
        anon_key: Option<&str>,
        fallback_url: Option<&str>,
    ) -> Result<SupabaseSettings> {
        let url = url
            .or(self.store.url.as_deref())
            .or(fallback_url)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No project URL configured.\n\
                     Pass --url, set SUPABASE_URL, add store.url to the config file,\n\
                     or run: seafarm-sync project set <url>"
                )
            })?;
        let project_url = validate_project_url(url)?;

        let anon_key = anon_key
            .or(self.store.anon_key.as_deref())
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No anon key configured.\n\
                     Pass --anon-key, set SUPABASE_ANON_KEY, or add store.anon_key to the config file"
                )
            })?;

        Ok(SupabaseSettings {
            project_url,
            anon_key: anon_key.to_string(),
            schema: self.store.schema.clone(),
            request_timeout: Duration::from_secs(self.store.request_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.realtime.heartbeat_secs),
            join_timeout: Duration::from_secs(self.realtime.join_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.store.schema, "public");
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.realtime.heartbeat_secs, 30);
        assert!(config.tables.is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = SyncConfig::from_toml(
            r#"
            tables = ["sites", "modules"]

            [store]
            url = "https://abcd.supabase.co"

            [retry]
            base_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.tables, vec!["sites", "modules"]);
        assert_eq!(config.store.url.as_deref(), Some("https://abcd.supabase.co"));
        assert_eq!(config.store.request_timeout_secs, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.policy().base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(SyncConfig::from_toml("tables = [\"bad-name\"]").is_err());
        assert!(SyncConfig::from_toml("[retry]\nmax_attempts = 0").is_err());
        assert!(SyncConfig::from_toml("[store]\nurl = \"ftp://x\"").is_err());
        assert!(SyncConfig::from_toml("tables = 3").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[realtime]\njoin_timeout_secs = 3").unwrap();

        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.realtime.join_timeout_secs, 3);

        assert!(SyncConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_settings_precedence() {
        let mut config = SyncConfig::default();
        config.store.url = Some("https://file.supabase.co".into());
        config.store.anon_key = Some("file-key".into());

        let settings = config
            .supabase_settings(Some("https://flag.supabase.co"), None, None)
            .unwrap();
        assert_eq!(settings.project_url.host_str(), Some("flag.supabase.co"));
        assert_eq!(settings.anon_key, "file-key");

        let settings = config.supabase_settings(None, Some("flag-key"), None).unwrap();
        assert_eq!(settings.project_url.host_str(), Some("file.supabase.co"));
        assert_eq!(settings.anon_key, "flag-key");

        let empty = SyncConfig::default();
        let settings = empty
            .supabase_settings(None, Some("k"), Some("https://saved.supabase.co"))
            .unwrap();
        assert_eq!(settings.project_url.host_str(), Some("saved.supabase.co"));
        assert!(empty.supabase_settings(None, Some("k"), None).is_err());
        assert!(empty
            .supabase_settings(Some("https://x.supabase.co"), None, None)
            .is_err());
    }
}
