#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub enum ObjectStoreError {
    Io { key: String, source: std::io::Error },
    InvalidKey(String),
    NotFound(String),
}

impl std::fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { key, source } => write!(f, "object {key}: {source}"),
            Self::InvalidKey(key) => write!(f, "invalid object key: {key}"),
            Self::NotFound(key) => write!(f, "object not found: {key}"),
        }
    }
}

impl std::error::Error for ObjectStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Blob storage addressed by `/`-separated keys.
pub trait ObjectStore: Send + Sync {
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;
}

/// Object store backed by a local directory tree.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let trimmed = key.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(trimmed);
        let all_normal = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !all_normal {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), ObjectStoreError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ObjectStoreError::Io {
                    key: dir.display().to_string(),
                    source,
                });
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| ObjectStoreError::Io {
                key: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| ObjectStoreError::Io {
                key: path.display().to_string(),
                source,
            })?;
            if file_type.is_dir() {
                self.walk(&path, out)?;
            } else if file_type.is_file()
                && let Some(key) = self.key_for(&path)
            {
                out.push(key);
            }
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        // Walk from the deepest directory the prefix fully names.
        let prefix = prefix.trim_start_matches('/');
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part)?
        };
        let mut keys = Vec::new();
        self.walk(&start, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::NotFound(key.to_string())
            } else {
                ObjectStoreError::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.resolve(key)?;
        let io_err = |source: std::io::Error| ObjectStoreError::Io {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Write-then-rename so readers never observe a partial object.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)
    }
}

/// In-process object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        if key.trim().is_empty() {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_store_round_trips_and_lists_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store.put("results/J1/design_1.pdb", b"a").expect("put");
        store.put("results/J1/sub/design_2.pdb", b"b").expect("put");
        store.put("results/J2/design_1.pdb", b"c").expect("put");

        assert_eq!(store.get("results/J1/design_1.pdb").expect("get"), b"a");
        assert_eq!(
            store.list("results/J1/").expect("list"),
            vec![
                "results/J1/design_1.pdb".to_string(),
                "results/J1/sub/design_2.pdb".to_string(),
            ]
        );
        assert_eq!(store.list("results/J").expect("list").len(), 3);
        assert!(store.list("missing/").expect("list").is_empty());
    }

    #[test]
    fn local_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.put("../outside.pdb", b"x"),
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("results/../../etc/passwd"),
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("results/none.pdb"),
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[test]
    fn memory_store_lists_sorted() {
        let store = MemoryObjectStore::new();
        store.put("b/2", b"2").expect("put");
        store.put("b/1", b"1").expect("put");
        store.put("a/1", b"0").expect("put");
        assert_eq!(store.list("b/").expect("list"), vec!["b/1", "b/2"]);
    }
}
