use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    path::PathBuf,
    str::FromStr,
};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

pub const TASK_QUEUE_KEY: &str = "PLUMLINE_TASK_QUEUE";
pub const TESTING_MODE_KEY: &str = "PLUMLINE_TESTING_MODE";
pub const CONFIRM_DELIVERIES_KEY: &str = "PLUMLINE_CONFIRM_DELIVERIES";
pub const PREFETCH_KEY: &str = "PLUMLINE_PREFETCH";
pub const REPLY_PREFIX_KEY: &str = "PLUMLINE_REPLY_PREFIX";
pub const WORKER_ID_KEY: &str = "PLUMLINE_WORKER_ID";
pub const UNHANDLED_KEY: &str = "PLUMLINE_UNHANDLED";
pub const BUNDLE_DIR_KEY: &str = "PLUMLINE_BUNDLE_DIR";

pub const DEFAULT_TASK_QUEUE: &str = "plumline.tasks";
pub const DEFAULT_REPLY_PREFIX: &str = "plumline.reply";

/// Read-only source of string settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
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

/// The process environment layered over an optional `.env` file. Variables
/// already set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    file: BTreeMap<String, String>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let mut file = BTreeMap::new();
        match dotenvy::from_path_iter(&env_file) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok((key, value)) => {
                            file.insert(key, value);
                        }
                        Err(err) => warn!("skipping line in {}: {err}", env_file.display()),
                    }
                }
                info!("Loaded {} settings from {}", file.len(), env_file.display());
            }
            Err(_) => debug!("no .env at {}, using the process environment", env_file.display()),
        }

        Box::new(Self { env_file, file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = self.file.keys().cloned().collect();
        keys.extend(env::vars().map(|(k, _)| k));
        keys.into_iter().collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok().or_else(|| self.file.get(key).cloned())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// Fixed settings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: BTreeMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        Box::new(Self {
            map: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// What a worker does with a task no receiver accepts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum UnhandledPolicy {
    /// Return the task to the queue for another worker.
    #[default]
    Requeue,
    /// Drop the task.
    Discard,
}

/// Settings shared by the task publisher and subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TaskQueueConfig {
    pub task_queue: String,
    /// Queues are transient and auto-deleted.
    pub testing_mode: bool,
    pub confirm_deliveries: bool,
    /// Deliveries a subscriber may hold unacknowledged at once.
    pub prefetch: usize,
    pub reply_prefix: String,
    pub worker_id: Option<String>,
    pub unhandled: UnhandledPolicy,
    pub bundle_dir: Option<PathBuf>,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            testing_mode: false,
            confirm_deliveries: true,
            prefetch: 1,
            reply_prefix: DEFAULT_REPLY_PREFIX.to_string(),
            worker_id: None,
            unhandled: UnhandledPolicy::default(),
            bundle_dir: None,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, fallback: T) -> T {
    match raw {
        None => fallback,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("ignoring invalid value `{raw}` for {key}");
                fallback
            }
        },
    }
}

fn parse_flag(key: &str, raw: Option<String>, fallback: bool) -> bool {
    match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        None => fallback,
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!("ignoring invalid flag `{v}` for {key}");
            fallback
        }
    }
}

impl TaskQueueConfig {
    /// Read the task-queue settings, falling back to defaults for anything
    /// missing or unparsable.
    pub async fn from_config(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        let cfg = &config.0;
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        Self {
            task_queue: non_empty(cfg.get(TASK_QUEUE_KEY).await).unwrap_or(defaults.task_queue),
            testing_mode: parse_flag(TESTING_MODE_KEY, cfg.get(TESTING_MODE_KEY).await, defaults.testing_mode),
            confirm_deliveries: parse_flag(
                CONFIRM_DELIVERIES_KEY,
                cfg.get(CONFIRM_DELIVERIES_KEY).await,
                defaults.confirm_deliveries,
            ),
            prefetch: parse_or(PREFETCH_KEY, cfg.get(PREFETCH_KEY).await, defaults.prefetch).max(1),
            reply_prefix: non_empty(cfg.get(REPLY_PREFIX_KEY).await).unwrap_or(defaults.reply_prefix),
            worker_id: non_empty(cfg.get(WORKER_ID_KEY).await),
            unhandled: parse_or(UNHANDLED_KEY, cfg.get(UNHANDLED_KEY).await, defaults.unhandled),
            bundle_dir: non_empty(cfg.get(BUNDLE_DIR_KEY).await).map(PathBuf::from),
        }
    }

    /// Defaults suited to tests: transient queues and a unique queue name.
    pub fn testing() -> Self {
        Self {
            task_queue: format!("{DEFAULT_TASK_QUEUE}.test-{}", uuid::Uuid::new_v4()),
            testing_mode: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn map_config_manager_reads_its_pairs() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([("b", "2"), ("a", "1")]));

        assert_eq!(mgr.0.get("a").await, Some("1".to_string()));
        assert_eq!(mgr.0.get("missing").await, None);
        assert_eq!(mgr.0.keys().await, vec!["a".to_string(), "b".to_string()]);

        let copy = mgr.clone();
        assert_eq!(copy.0.get("b").await, Some("2".to_string()));
        assert_eq!(format!("{copy:?}"), "MapConfigManager(2 entries)");
    }

    #[tokio::test]
    async fn env_config_manager_reads_the_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "# worker settings\nPLUMLINE_TEST_WORKER=w7\nPLUMLINE_TEST_QUOTED=\"a b\"\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("PLUMLINE_TEST_WORKER").await, Some("w7".to_string()));
        assert_eq!(mgr.get("PLUMLINE_TEST_QUOTED").await, Some("a b".to_string()));
        assert_eq!(mgr.get("PLUMLINE_TEST_ABSENT").await, None);
        assert!(mgr.keys().await.contains(&"PLUMLINE_TEST_WORKER".to_string()));
        // Reading the file leaves the process environment alone.
        assert!(env::var("PLUMLINE_TEST_WORKER").is_err());
    }

    #[tokio::test]
    async fn environment_wins_over_the_env_file() {
        let Ok(path) = env::var("PATH") else {
            return;
        };
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "PATH=/from/the/file\n").unwrap();

        let mgr = EnvConfigManager::new(env_path);
        assert_eq!(mgr.get("PATH").await, Some(path));
    }

    #[tokio::test]
    async fn missing_env_file_reads_the_environment_only() {
        let dir = tempdir().unwrap();
        let mgr = ConfigManager(EnvConfigManager::new(dir.path().join("absent.env")));
        assert_eq!(mgr.0.get("PLUMLINE_TEST_ABSENT").await, None);
        assert_eq!(mgr.0.keys().await.len(), env::vars().count());
        assert!(format!("{mgr:?}").ends_with("absent.env)"));
    }

    #[tokio::test]
    async fn task_queue_config_reads_an_env_file() {
        if env::var(REPLY_PREFIX_KEY).is_ok() || env::var(WORKER_ID_KEY).is_ok() {
            return;
        }
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, format!("{REPLY_PREFIX_KEY}=file.reply\n{WORKER_ID_KEY}=w-file\n")).unwrap();

        let tq = TaskQueueConfig::from_config(&ConfigManager(EnvConfigManager::new(env_path))).await;
        assert_eq!(tq.reply_prefix, "file.reply");
        assert_eq!(tq.worker_id.as_deref(), Some("w-file"));
    }

    #[tokio::test]
    async fn task_queue_config_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        let tq = TaskQueueConfig::from_config(&config).await;
        assert_eq!(tq, TaskQueueConfig::default());
        assert_eq!(tq.task_queue, DEFAULT_TASK_QUEUE);
        assert!(tq.confirm_deliveries);
        assert_eq!(tq.prefetch, 1);
        assert_eq!(tq.unhandled, UnhandledPolicy::Requeue);
    }

    #[tokio::test]
    async fn task_queue_config_reads_overrides() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            (TASK_QUEUE_KEY, "jobs"),
            (TESTING_MODE_KEY, "yes"),
            (CONFIRM_DELIVERIES_KEY, "false"),
            (PREFETCH_KEY, "4"),
            (WORKER_ID_KEY, "worker-1"),
            (UNHANDLED_KEY, "Discard"),
            (BUNDLE_DIR_KEY, "/tmp/bundles"),
        ]));
        let tq = TaskQueueConfig::from_config(&config).await;
        assert_eq!(tq.task_queue, "jobs");
        assert!(tq.testing_mode);
        assert!(!tq.confirm_deliveries);
        assert_eq!(tq.prefetch, 4);
        assert_eq!(tq.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(tq.unhandled, UnhandledPolicy::Discard);
        assert_eq!(tq.bundle_dir, Some(PathBuf::from("/tmp/bundles")));
    }

    #[tokio::test]
    async fn invalid_values_fall_back() {
        let config = ConfigManager(MapConfigManager::from_pairs([
            (PREFETCH_KEY, "many"),
            (UNHANDLED_KEY, "explode"),
            (CONFIRM_DELIVERIES_KEY, "maybe"),
        ]));
        let tq = TaskQueueConfig::from_config(&config).await;
        assert_eq!(tq.prefetch, 1);
        assert_eq!(tq.unhandled, UnhandledPolicy::Requeue);
        assert!(tq.confirm_deliveries);
    }
}
