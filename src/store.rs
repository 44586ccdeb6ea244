//! Persistent key-value store used for calibration, channel configuration
//! and energy counters. Single-key writes are atomic; there are no
//! multi-key transactions.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

pub trait KvStore: Send + Sync + 'static {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, namespace: &str, key: &str) -> Result<()>;
    /// Drop every key in the namespace.
    fn clear(&self, namespace: &str) -> Result<()>;
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(namespace, key)? {
        None => Ok(None),
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    }
}

pub fn put_json<T: Serialize>(
    store: &dyn KvStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    store.put(namespace, key, &serde_json::to_vec(value)?)
}

fn check_component(component: &str) -> Result<()> {
    let well_formed = !component.is_empty()
        && component.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(Error::ConfigInvalid(format!("malformed store key {:?}", component)))
    }
}

/// File-per-key store rooted at a directory; writes go through a temporary
/// file and a rename so a power cut never leaves a torn value.
#[derive(Debug)]
pub struct FsKvStore {
    root: PathBuf,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> FsKvStore {
        FsKvStore { root: root.into() }
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        check_component(namespace)?;
        check_component(key)?;
        Ok(self.root.join(namespace).join(key))
    }
}

impl KvStore for FsKvStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(namespace, key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path(namespace, key)?;
        let dir = path.parent().expect("store path has a parent");
        fs::create_dir_all(dir)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        match fs::remove_file(self.path(namespace, key)?) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        check_component(namespace)?;
        match fs::remove_dir_all(self.root.join(namespace)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Volatile store for tests.
#[derive(Debug, Default)]
pub struct MemKvStore {
    map: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemKvStore {
    pub fn new() -> MemKvStore {
        MemKvStore::default()
    }

    /// Number of live keys in a namespace.
    pub fn key_count(&self, namespace: &str) -> usize {
        self.map.lock().keys().filter(|(ns, _)| ns == namespace).count()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(&(namespace.into(), key.into())).cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().insert((namespace.into(), key.into()), value.to_vec());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.map.lock().remove(&(namespace.into(), key.into()));
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        self.map.lock().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKvStore::new(dir.path());
        assert_eq!(store.get("energy", "ch0_active_imp").unwrap(), None);
        put_json(&store, "energy", "ch0_active_imp", &12.5f64).unwrap();
        let value: Option<f64> = get_json(&store, "energy", "ch0_active_imp").unwrap();
        assert_eq!(value, Some(12.5));
        store.remove("energy", "ch0_active_imp").unwrap();
        assert_eq!(store.get("energy", "ch0_active_imp").unwrap(), None);
    }

    #[test]
    fn test_fs_store_clear_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKvStore::new(dir.path());
        store.put("energy", "a", b"1").unwrap();
        store.put("energy", "b", b"2").unwrap();
        store.put("channels", "ch1", b"3").unwrap();
        store.clear("energy").unwrap();
        assert_eq!(store.get("energy", "a").unwrap(), None);
        assert_eq!(store.get("channels", "ch1").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsKvStore::new(dir.path());
        assert!(store.put("../escape", "key", b"x").is_err());
        assert!(store.put("ns", "a/b", b"x").is_err());
        assert!(store.put("", "key", b"x").is_err());
    }
}
