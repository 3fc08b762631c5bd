use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::Shared;

/// A realm-scoped view over the store: every user key is transparently
/// prefixed with `"<realm>_"`, which keeps key listings computable by
/// prefix filtering.
///
/// Values are JSON on disk; use [`RealmExt`] for typed access.
pub trait Realm: Send + Sync {
    fn clear(&self) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn has(&self, key: &str) -> bool;
    fn keys(&self) -> Vec<String>;
    fn nb_keys(&self) -> usize;
    fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn sync(&self) -> Result<(), StoreError>;
}

/// Typed helpers over any [`Realm`].
pub trait RealmExt: Realm {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)?;
        self.set_raw(key, &raw)
    }
}

impl<R: Realm + ?Sized> RealmExt for R {}

impl<R: Realm + ?Sized> Realm for Arc<R> {
    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get_raw(key)
    }
    fn has(&self, key: &str) -> bool {
        (**self).has(key)
    }
    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }
    fn nb_keys(&self) -> usize {
        (**self).nb_keys()
    }
    fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).set_raw(key, value)
    }
    fn sync(&self) -> Result<(), StoreError> {
        (**self).sync()
    }
}

/// Store-backed realm view handed out by [`crate::Store::realm`].
pub struct RealmView {
    prefix: String,
    shared: Arc<Shared>,
}

impl RealmView {
    pub(crate) fn new(realm: &str, shared: Arc<Shared>) -> Self {
        RealmView {
            prefix: format!("{realm}_"),
            shared,
        }
    }

    fn full_key(&self, key: &str) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(self.prefix.as_bytes());
        full.extend_from_slice(key.as_bytes());
        full
    }
}

impl Realm for RealmView {
    fn clear(&self) -> Result<(), StoreError> {
        for key in self.keys() {
            self.delete(&key)?;
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.shared.engine().delete(&self.full_key(key))
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.shared.engine().get(&self.full_key(key))
    }

    fn has(&self, key: &str) -> bool {
        self.shared.engine().has(&self.full_key(key))
    }

    fn keys(&self) -> Vec<String> {
        self.shared
            .engine()
            .keys_with_prefix(self.prefix.as_bytes())
            .into_iter()
            .map(|k| String::from_utf8_lossy(&k[self.prefix.len()..]).into_owned())
            .collect()
    }

    fn nb_keys(&self) -> usize {
        self.shared
            .engine()
            .nb_keys_with_prefix(self.prefix.as_bytes())
    }

    fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let full = self.full_key(key);
        self.shared.engine().put(&full, value)?;
        self.shared.observe_sizes(full.len(), value.len());
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.shared.engine().sync()
    }
}

/// In-memory realm for tests of store consumers, in the spirit of keeping a
/// virtual twin next to the real implementation.
#[derive(Default)]
pub struct MemoryRealm {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRealm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Realm for MemoryRealm {
    fn clear(&self) -> Result<(), StoreError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn has(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    fn nb_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
