use crate::categories::{CategoryConfiguration, ClassificationMode};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const MODE_KEY: &str = "mode";
pub const CATEGORY_MAP_KEY: &str = "categoryMap";

/// Key/value bag exchanged with a store.
pub type ValueBag = Map<String, Value>;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Keys whose stored values changed in one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub keys: Vec<String>,
}

impl ChangeSet {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Whether a scan depends on any of the changed keys.
    pub fn affects_scan(&self) -> bool {
        self.contains(MODE_KEY) || self.contains(CATEGORY_MAP_KEY)
    }
}

/// Persistent settings owned by someone else. Reads are always fresh.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Values for `keys`; absent keys are simply missing from the bag.
    async fn get(&self, keys: &[&str]) -> Result<ValueBag>;

    /// Merges `values` into the store and notifies subscribers of the
    /// keys that actually changed.
    async fn set(&self, values: ValueBag) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet>;
}

/// Everything a scan needs from the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanSettings {
    pub mode: ClassificationMode,
    pub categories: CategoryConfiguration,
}

impl ScanSettings {
    pub fn from_bag(bag: &ValueBag) -> Self {
        Self {
            mode: ClassificationMode::from_value(bag.get(MODE_KEY)),
            categories: CategoryConfiguration::from_value(bag.get(CATEGORY_MAP_KEY)),
        }
    }
}

/// Reads mode and categories. Store failures degrade to defaults.
pub async fn read_scan_settings(store: &dyn ConfigStore) -> ScanSettings {
    match store.get(&[MODE_KEY, CATEGORY_MAP_KEY]).await {
        Ok(bag) => ScanSettings::from_bag(&bag),
        Err(e) => {
            log::error!("Failed to read settings, using defaults: {e:#}");
            ScanSettings::default()
        }
    }
}

fn changed_keys(old: &ValueBag, new: &ValueBag) -> Vec<String> {
    let mut keys: Vec<String> = new
        .iter()
        .filter(|(k, v)| old.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    keys.extend(old.keys().filter(|k| !new.contains_key(k.as_str())).cloned());
    keys
}

fn select_keys(bag: &ValueBag, keys: &[&str]) -> ValueBag {
    keys.iter()
        .filter_map(|k| bag.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

fn publish(sender: &broadcast::Sender<ChangeSet>, keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    log::debug!("Store keys changed: {}", keys.join(", "));
    // No subscribers is fine.
    let _ = sender.send(ChangeSet { keys });
}

/// In-process store.
pub struct MemoryStore {
    values: Mutex<ValueBag>,
    changes: broadcast::Sender<ChangeSet>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_values(ValueBag::new())
    }

    pub fn with_values(values: ValueBag) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            values: Mutex::new(values),
            changes,
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<ValueBag> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(select_keys(&values, keys))
    }

    async fn set(&self, updates: ValueBag) -> Result<()> {
        let changed = {
            let mut values = self
                .values
                .lock()
                .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
            let mut changed = Vec::new();
            for (key, value) in updates {
                if values.get(&key) != Some(&value) {
                    changed.push(key.clone());
                    values.insert(key, value);
                }
            }
            changed
        };
        publish(&self.changes, changed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}

/// Store persisted as one JSON object on disk.
///
/// Writes go through a temp file and rename. [`FileStore::spawn_poller`]
/// picks up edits made by other processes.
pub struct FileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    last_seen: Mutex<ValueBag>,
    changes: broadcast::Sender<ChangeSet>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
            last_seen: Mutex::new(ValueBag::new()),
            changes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<ValueBag> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ValueBag::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read settings store: {}", self.path.display())
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(ValueBag::new());
        }
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings store: {}", self.path.display()))?;
        match value {
            Value::Object(bag) => Ok(bag),
            _ => bail!(
                "Settings store {} does not contain a JSON object",
                self.path.display()
            ),
        }
    }

    async fn write_all(&self, bag: &ValueBag) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }
        let content = serde_json::to_string_pretty(bag)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Compares the file against the last observed content and publishes
    /// any keys that changed.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        let current = self.read_all().await?;
        let changed = {
            let mut last_seen = self
                .last_seen
                .lock()
                .map_err(|_| anyhow::anyhow!("File store lock poisoned"))?;
            let changed = changed_keys(&last_seen, &current);
            *last_seen = current;
            changed
        };
        publish(&self.changes, changed.clone());
        Ok(changed)
    }

    /// Polls the file for external edits until the store is dropped.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.refresh().await {
                    log::warn!("Settings store poll failed: {e:#}");
                }
            }
        })
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn get(&self, keys: &[&str]) -> Result<ValueBag> {
        let bag = self.read_all().await?;
        Ok(select_keys(&bag, keys))
    }

    async fn set(&self, updates: ValueBag) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut bag = self.read_all().await?;
        let before = bag.clone();
        let written: Vec<String> = updates.keys().cloned().collect();
        for (key, value) in updates {
            bag.insert(key, value);
        }
        self.write_all(&bag).await?;

        // Diffed against the file as just read. Only the written keys are
        // folded into `last_seen`; other differences stay for `refresh`.
        let changed = changed_keys(&before, &bag);
        {
            let mut last_seen = self
                .last_seen
                .lock()
                .map_err(|_| anyhow::anyhow!("File store lock poisoned"))?;
            for key in written {
                if let Some(value) = bag.get(&key) {
                    last_seen.insert(key, value.clone());
                }
            }
        }
        publish(&self.changes, changed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }
}
