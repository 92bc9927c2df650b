//! Process settings: where the data and scripts live, how to log.

use async_trait::async_trait;
use dashmap::DashMap;
use delivery_plugin::LogLevel;
use std::path::{Path, PathBuf};
use std::{env, fs};
use tracing::{info, warn};

use crate::logger::LogConfig;

pub const DATA_DIR_KEY: &str = "SCRIPT_DELIVERY_DATA";
pub const ROOT_DIR_KEY: &str = "SCRIPT_DELIVERY_ROOT";
pub const LOG_LEVEL_KEY: &str = "SCRIPT_DELIVERY_LOG_LEVEL";
pub const OTEL_ENDPOINT_KEY: &str = "SCRIPT_DELIVERY_OTEL_ENDPOINT";
/// Rolling log files go here; without it logs go to stderr.
pub const LOG_DIR_KEY: &str = "SCRIPT_DELIVERY_LOG_DIR";

pub const SCRIPTS_SUBDIR: &str = "scripts";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from an optional `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {err}", env_file.display()),
            }
        }
        Box::new(Self { env_file })
    }

    /// Rewrite the `.env` file, keeping every line except `key`'s, and
    /// appending `key=value` when a value is given.
    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = content
            .lines()
            .filter(|line| line.split_once('=').is_none_or(|(k, _)| k.trim() != key))
            .map(str::to_string)
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|v| !v.is_empty())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(err) = self.rewrite_env_file(key, None) {
                warn!("could not update {}: {err}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, used by tests and embedding hosts.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let manager = Self::new();
        for (key, value) in entries {
            manager.map.insert(key.to_string(), value.to_string());
        }
        manager
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// `SCRIPT_DELIVERY_DATA`, else `$SCRIPT_DELIVERY_ROOT/data`, else `./data`.
pub fn resolve_data_dir_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(data) = lookup(DATA_DIR_KEY).filter(|v| !v.is_empty()) {
        return PathBuf::from(data);
    }
    match lookup(ROOT_DIR_KEY).filter(|v| !v.is_empty()) {
        Some(root) => PathBuf::from(root).join("data"),
        None => PathBuf::from("./data"),
    }
}

pub fn resolve_data_dir() -> PathBuf {
    resolve_data_dir_from(|key| env::var(key).ok())
}

pub fn scripts_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(SCRIPTS_SUBDIR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub log: LogConfig,
}

impl Settings {
    /// Read settings through a config manager. Unknown log levels fall back
    /// to `info`.
    pub async fn load(manager: &ConfigManager) -> Settings {
        let data = manager.0.get(DATA_DIR_KEY).await;
        let root = manager.0.get(ROOT_DIR_KEY).await;
        let data_dir = resolve_data_dir_from(|key| match key {
            DATA_DIR_KEY => data.clone(),
            ROOT_DIR_KEY => root.clone(),
            _ => None,
        });

        let log_level = match manager.0.get(LOG_LEVEL_KEY).await {
            Some(level) => level.parse::<LogLevel>().unwrap_or_else(|_| {
                warn!(%level, "unknown log level, using info");
                LogLevel::Info
            }),
            None => LogLevel::Info,
        };
        let otel_endpoint = manager.0.get(OTEL_ENDPOINT_KEY).await;
        let log_dir = manager.0.get(LOG_DIR_KEY).await.filter(|v| !v.is_empty()).map(PathBuf::from);

        Settings {
            log: LogConfig::new(log_level, log_dir, otel_endpoint),
            data_dir,
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        scripts_dir(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn data_dir_prefers_explicit_data_env() {
        let pairs = [(DATA_DIR_KEY, "/srv/data"), (ROOT_DIR_KEY, "/opt/delivery")];
        assert_eq!(resolve_data_dir_from(lookup(&pairs)), PathBuf::from("/srv/data"));
    }

    #[test]
    fn data_dir_falls_back_to_root_then_cwd() {
        let pairs = [(ROOT_DIR_KEY, "/opt/delivery")];
        assert_eq!(resolve_data_dir_from(lookup(&pairs)), PathBuf::from("/opt/delivery/data"));
        assert_eq!(resolve_data_dir_from(lookup(&[])), PathBuf::from("./data"));
        assert_eq!(
            resolve_data_dir_from(lookup(&[(DATA_DIR_KEY, "")])),
            PathBuf::from("./data")
        );
    }

    #[test]
    fn scripts_live_under_the_data_dir() {
        assert_eq!(scripts_dir(Path::new("/srv/data")), PathBuf::from("/srv/data/scripts"));
    }

    #[tokio::test]
    async fn settings_load_from_map_manager() {
        let manager = ConfigManager(MapConfigManager::with_entries([
            (ROOT_DIR_KEY, "/opt/delivery"),
            (LOG_LEVEL_KEY, "Debug"),
            (OTEL_ENDPOINT_KEY, "http://localhost:4318"),
        ]));
        let settings = Settings::load(&manager).await;

        assert_eq!(settings.data_dir, PathBuf::from("/opt/delivery/data"));
        assert_eq!(settings.scripts_dir(), PathBuf::from("/opt/delivery/data/scripts"));
        assert_eq!(settings.log.log_level, LogLevel::Debug);
        assert_eq!(settings.log.otel_endpoint.as_deref(), Some("http://localhost:4318"));
        assert_eq!(settings.log.log_dir, None);
    }

    #[tokio::test]
    async fn log_dir_is_only_set_when_configured() {
        let manager = ConfigManager(MapConfigManager::with_entries([(ROOT_DIR_KEY, "/opt/delivery")]));
        assert_eq!(Settings::load(&manager).await.log.log_dir, None);

        let manager = ConfigManager(MapConfigManager::with_entries([
            (ROOT_DIR_KEY, "/opt/delivery"),
            (LOG_DIR_KEY, "/var/log/delivery"),
        ]));
        assert_eq!(
            Settings::load(&manager).await.log.log_dir,
            Some(PathBuf::from("/var/log/delivery"))
        );
    }

    #[tokio::test]
    async fn unknown_log_level_falls_back_to_info() {
        let manager = ConfigManager(MapConfigManager::with_entries([(LOG_LEVEL_KEY, "loud")]));
        assert_eq!(Settings::load(&manager).await.log.log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn map_config_manager_set_get_del() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar").await.unwrap();
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn env_config_manager_reads_dotenv_file() {
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "SCRIPT_DELIVERY_TEST_DOTENV=from-file\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(
            mgr.get("SCRIPT_DELIVERY_TEST_DOTENV").await,
            Some("from-file".to_string())
        );
    }

    #[tokio::test]
    async fn env_config_manager_persists_set_and_del() {
        let key = "SCRIPT_DELIVERY_TEST_PERSIST";
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "OTHER=1\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        mgr.set(key, "on").await.unwrap();
        assert_eq!(mgr.get(key).await, Some("on".to_string()));
        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("OTHER=1") && content.contains(&format!("{key}=on")));

        mgr.del(key).await;
        assert_eq!(mgr.get(key).await, None);
        assert!(!fs::read_to_string(&env_path).unwrap().contains(key));
    }
}
