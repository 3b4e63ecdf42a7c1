//! Generic persistent key-value store (C2).
//!
//! Used as the substrate under both the credential pool and the IP
//! subsystem: load once at init (empty on missing file), keep a single
//! in-memory map as the source of truth, and flush the whole file under
//! lock whenever a writer has raised the dirty flag. Reads never touch disk.
//!
//! Some stores are written flat (credentials.toml, whose format is owned by
//! whatever minted the credentials); others nest under a single top-level
//! table (`ip_stats.toml`'s `[ips]`, `ban_operations.toml`'s `[operators]`),
//! so the table name is a per-instance option rather than baked into the type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

/// A whole-file-rewrite TOML-backed map, keyed by string.
pub struct KvStore<V> {
    path: PathBuf,
    table: Option<&'static str>,
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    map: BTreeMap<String, V>,
    dirty: bool,
}

impl<V> KvStore<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Loads `path` if it exists; starts empty (not an error) if it doesn't.
    /// The map sits at the top level of the file with no wrapper table.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        Self::load_inner(path, None).await
    }

    /// Like [`Self::load`], but the map is nested one level down under
    /// `table`, e.g. `[ips]` / `[operators]`.
    pub async fn load_nested(path: impl AsRef<Path>, table: &'static str) -> Self {
        Self::load_inner(path, Some(table)).await
    }

    async fn load_inner(path: impl AsRef<Path>, table: Option<&'static str>) -> Self {
        let path = path.as_ref().to_path_buf();
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match Self::decode(&contents, table) {
                Ok(map) => {
                    info!(path = %path.display(), count = map.len(), "loaded kv store");
                    map
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to parse kv store, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no existing kv store, starting fresh");
                BTreeMap::new()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read kv store, starting empty");
                BTreeMap::new()
            }
        };
        Self {
            path,
            table,
            inner: Mutex::new(Inner { map, dirty: false }),
        }
    }

    fn decode(contents: &str, table: Option<&str>) -> Result<BTreeMap<String, V>, toml::de::Error> {
        let root: toml::Value = toml::from_str(contents)?;
        let target = match table {
            Some(name) => root
                .get(name)
                .cloned()
                .unwrap_or_else(|| toml::Value::Table(Default::default())),
            None => root,
        };
        target.try_into()
    }

    fn encode(&self, snapshot: &BTreeMap<String, V>) -> Result<String, toml::ser::Error> {
        match self.table {
            Some(name) => {
                let mut root = toml::map::Map::new();
                root.insert(name.to_owned(), toml::Value::try_from(snapshot)?);
                toml::to_string_pretty(&toml::Value::Table(root))
            }
            None => toml::to_string_pretty(snapshot),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().map.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<String, V> {
        self.inner.lock().map.clone()
    }

    /// Mutates (or inserts) the record for `key` and marks the store dirty.
    pub fn mutate(&self, key: &str, f: impl FnOnce(&mut V)) -> bool
    where
        V: Default,
    {
        let mut guard = self.inner.lock();
        let entry = guard.map.entry(key.to_owned()).or_default();
        f(entry);
        guard.dirty = true;
        true
    }

    pub fn insert(&self, key: String, value: V) {
        let mut guard = self.inner.lock();
        guard.map.insert(key, value);
        guard.dirty = true;
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock();
        let removed = guard.map.remove(key);
        if removed.is_some() {
            guard.dirty = true;
        }
        removed
    }

    pub fn retain(&self, mut keep: impl FnMut(&str, &V) -> bool) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.map.len();
        guard.map.retain(|k, v| keep(k, v));
        let removed = before - guard.map.len();
        if removed > 0 {
            guard.dirty = true;
        }
        removed
    }

    pub fn mark_dirty(&self) {
        self.inner.lock().dirty = true;
    }

    /// Flushes to disk iff dirty; clears the dirty flag on success.
    pub async fn flush_if_dirty(&self) {
        let snapshot = {
            let mut guard = self.inner.lock();
            if !guard.dirty {
                return;
            }
            guard.dirty = false;
            guard.map.clone()
        };
        let rendered = match self.encode(&snapshot) {
            Ok(s) => s,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to serialize kv store");
                self.inner.lock().dirty = true;
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(path = %parent.display(), error = %e, "failed to create kv store directory");
            }
        }
        match tokio::fs::write(&self.path, rendered).await {
            Ok(()) => debug!(path = %self.path.display(), "kv store flushed"),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to write kv store");
                self.inner.lock().dirty = true;
            }
        }
    }

    /// Spawns a daemon task that flushes every `period` until `shutdown` fires.
    pub fn spawn_periodic_flush(
        self: std::sync::Arc<Self>,
        period: std::time::Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        self.flush_if_dirty().await;
                    }
                    _ = shutdown.cancelled() => {
                        self.flush_if_dirty().await;
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[derive(serde::Serialize, serde::Deserialize, Default, Clone, PartialEq, Debug)]
    struct Widget {
        count: u64,
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store: KvStore<Widget> = KvStore::load(dir.path().join("missing.toml")).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("widgets.toml");
        let store: KvStore<Widget> = KvStore::load(&path).await;
        store.mutate("a", |w| w.count += 1);
        store.mutate("b", |w| w.count += 5);
        store.flush_if_dirty().await;

        let reloaded: KvStore<Widget> = KvStore::load(&path).await;
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert_eq!(reloaded.get("a"), Some(Widget { count: 1 }));
        assert_eq!(reloaded.get("b"), Some(Widget { count: 5 }));
    }

    #[tokio::test]
    async fn flush_is_noop_when_not_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("widgets.toml");
        let store: KvStore<Widget> = KvStore::load(&path).await;
        store.flush_if_dirty().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn nested_store_writes_under_its_table_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ip_stats.toml");
        let store: KvStore<Widget> = KvStore::load_nested(&path, "ips").await;
        store.mutate("1.2.3.4", |w| w.count += 9);
        store.flush_if_dirty().await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("ips"), "expected the `ips` wrapper table in:\n{raw}");

        let reloaded: KvStore<Widget> = KvStore::load_nested(&path, "ips").await;
        assert_eq!(reloaded.get("1.2.3.4"), Some(Widget { count: 9 }));
    }
}
