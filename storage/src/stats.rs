use tracing::{debug, error};

use crate::realm::{Realm, RealmExt};

const MAX_SIZE_KEY_KEY: &str = "maxSizeKey";
const MAX_SIZE_VALUE_KEY: &str = "maxSizeValue";

/// Largest key and value sizes ever written, persisted in the `stats`
/// realm across restarts.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SizeStats {
    pub max_key: usize,
    pub max_value: usize,
}

impl SizeStats {
    pub(crate) fn observe(&mut self, key_len: usize, value_len: usize) {
        if key_len > self.max_key {
            self.max_key = key_len;
        }
        if value_len > self.max_value {
            self.max_value = value_len;
        }
    }
}

pub(crate) fn load(realm: &dyn Realm) -> SizeStats {
    let mut stats = SizeStats::default();
    match realm.get::<usize>(MAX_SIZE_KEY_KEY) {
        Ok(Some(v)) => {
            debug!(target: "storage", value = v, "loaded stat {MAX_SIZE_KEY_KEY}");
            stats.max_key = v;
        }
        Ok(None) => debug!(target: "storage", "no saved stat {MAX_SIZE_KEY_KEY} found"),
        Err(e) => error!(target: "storage", "failed to load the {MAX_SIZE_KEY_KEY} stat value: {e}"),
    }
    match realm.get::<usize>(MAX_SIZE_VALUE_KEY) {
        Ok(Some(v)) => {
            debug!(target: "storage", value = v, "loaded stat {MAX_SIZE_VALUE_KEY}");
            stats.max_value = v;
        }
        Ok(None) => debug!(target: "storage", "no saved stat {MAX_SIZE_VALUE_KEY} found"),
        Err(e) => {
            error!(target: "storage", "failed to load the {MAX_SIZE_VALUE_KEY} stat value: {e}")
        }
    }
    stats
}

pub(crate) fn save(realm: &dyn Realm, stats: SizeStats) {
    if let Err(e) = realm.set(MAX_SIZE_KEY_KEY, &stats.max_key) {
        error!(target: "storage", "failed to save the {MAX_SIZE_KEY_KEY} stat value: {e}");
    }
    if let Err(e) = realm.set(MAX_SIZE_VALUE_KEY, &stats.max_value) {
        error!(target: "storage", "failed to save the {MAX_SIZE_VALUE_KEY} stat value: {e}");
    }
    debug!(
        target: "storage",
        max_key = stats.max_key,
        max_value = stats.max_value,
        "saved size stats"
    );
}
