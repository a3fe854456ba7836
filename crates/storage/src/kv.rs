use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use snafu::{ResultExt, ensure};

use super::error::{
    CreateStoreDirectorySnafu, InvalidKeySnafu, InvariantViolationSnafu, ReadEntrySnafu,
    RemoveEntrySnafu, StorageResult, WriteEntrySnafu,
};

/// Durable string map the session store persists into.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned("memory-kv-get"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned("memory-kv-set"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| poisoned("memory-kv-remove"))?;
        entries.remove(key);
        Ok(())
    }
}

fn poisoned(stage: &'static str) -> super::error::StorageError {
    InvariantViolationSnafu {
        stage,
        details: "memory store lock poisoned".to_string(),
    }
    .build()
}

/// One `<key>.json` file per entry under a data directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str, stage: &'static str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || "._-".contains(character))
            && !key.starts_with('.');
        ensure!(
            valid,
            InvalidKeySnafu {
                stage,
                key: key.to_string(),
            }
        );

        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.entry_path(key, "file-kv-get")?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadEntrySnafu {
                stage: "file-kv-read",
                path: display_path(&path),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.entry_path(key, "file-kv-set")?;
        std::fs::create_dir_all(&self.dir).context(CreateStoreDirectorySnafu {
            stage: "file-kv-create-directory",
            path: display_path(&self.dir),
        })?;

        // Write-then-rename so a crash never leaves a half-written record behind.
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, value).context(WriteEntrySnafu {
            stage: "file-kv-write-temporary",
            path: display_path(&temp_path),
        })?;
        std::fs::rename(&temp_path, &path).context(WriteEntrySnafu {
            stage: "file-kv-rename-temporary",
            path: display_path(&path),
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.entry_path(key, "file-kv-remove")?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveEntrySnafu {
                stage: "file-kv-remove",
                path: display_path(&path),
            }),
        }
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("ikiganiro.chat_sessions").ok().flatten(), None);

        store
            .set("ikiganiro.chat_sessions", "[]")
            .expect("first write succeeds");
        store
            .set("ikiganiro.chat_sessions", "[1]")
            .expect("overwrite succeeds");
        assert_eq!(
            store.get("ikiganiro.chat_sessions").ok().flatten(),
            Some("[1]".to_string())
        );

        store
            .remove("ikiganiro.chat_sessions")
            .expect("remove succeeds");
        store
            .remove("ikiganiro.chat_sessions")
            .expect("removing a missing key is a no-op");
        assert_eq!(store.get("ikiganiro.chat_sessions").ok().flatten(), None);
    }

    #[test]
    fn memory_store_behaves_like_a_map() {
        exercise(&MemoryKeyValueStore::new());
    }

    #[test]
    fn file_store_behaves_like_a_map() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileKeyValueStore::new(dir.path().join("nested").join("data"));
        exercise(&store);
    }

    #[test]
    fn file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileKeyValueStore::new(dir.path());

        for key in ["../escape", "a/b", "", ".hidden"] {
            assert!(matches!(
                store.set(key, "x"),
                Err(StorageError::InvalidKey { .. })
            ));
        }
    }
}
