/*
    The local settings authority.

    Values are addressed by path (e.g. /Settings/Devices/shelly_aabbcc1/Position),
    changes are announced on a broadcast channel and optionally persisted to a
    YAML file. Until the store is marked online nobody can negotiate against it.
*/

pub mod negotiator;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

pub use negotiator::{NegotiatedSettings, SettingsNegotiator, SETTINGS_TIMEOUT};

/// A setting with its default and an integer range. A range of 0..0 means unlimited.
#[derive(Debug, Clone)]
pub struct Setting {
    pub path: String,
    pub default: Value,
    pub min: i64,
    pub max: i64,
}

impl Setting {
    pub fn new<V: Into<Value>>(path: String, default: V, min: i64, max: i64) -> Self {
        return Setting {
            path,
            default: default.into(),
            min,
            max,
        };
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    pub path: String,
    pub value: Value,
}

struct SettingsStore {
    values: BTreeMap<String, Value>,
    limits: HashMap<String, (i64, i64)>,
    file: Option<PathBuf>,
}

impl SettingsStore {
    fn save(&self) {
        let file = match &self.file {
            Some(f) => f,
            None => return,
        };

        /* Keep the last good copy around in case we die while writing */
        if file.exists() {
            let backup = file.with_extension("bak");
            if let Err(e) = fs::copy(file, &backup) {
                error!("Backing up settings to {backup:?} failed, not replacing them: {e:?}");
                return;
            }
        }

        let data = match serde_yml::to_string(&self.values) {
            Ok(d) => d,
            Err(e) => {
                error!("Unable to serialize settings: {e:?}");
                return;
            }
        };

        match fs::write(file, data.as_bytes()) {
            Ok(_) => { debug!("Settings written to {file:?}"); }
            Err(e) => { error!("Error writing settings {e:?}"); }
        }
    }
}

#[derive(Clone)]
pub struct LocalSettings {
    store: Arc<RwLock<SettingsStore>>,
    changes: broadcast::Sender<SettingsChange>,
    online: Arc<watch::Sender<bool>>,
}

impl LocalSettings {
    /// An in memory store which is not online yet
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(100);
        let (online, _) = watch::channel(false);
        return LocalSettings {
            store: Arc::new(RwLock::new(SettingsStore {
                values: BTreeMap::new(),
                limits: HashMap::new(),
                file: None,
            })),
            changes,
            online: Arc::new(online),
        };
    }

    /// Load settings from a YAML file, the file is created on the first change
    pub fn open(file: PathBuf) -> Self {
        let settings = LocalSettings::new();

        let values = match fs::read_to_string(&file) {
            Ok(contents) => match serde_yml::from_str::<BTreeMap<String, Value>>(&contents) {
                Ok(v) => {
                    info!("Loaded {} settings from {file:?}", v.len());
                    v
                }
                Err(e) => {
                    warn!("Unable to parse settings in {file:?}, starting empty: {e:?}");
                    BTreeMap::new()
                }
            },
            Err(_) => {
                info!("No settings found at {file:?}, starting empty");
                BTreeMap::new()
            }
        };

        {
            let mut store = settings.write();
            store.values = values;
            store.file = Some(file);
        }

        return settings;
    }

    fn read(&self) -> RwLockReadGuard<'_, SettingsStore> {
        return self.store.read().unwrap_or_else(|e| e.into_inner());
    }

    fn write(&self) -> RwLockWriteGuard<'_, SettingsStore> {
        return self.store.write().unwrap_or_else(|e| e.into_inner());
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        return *self.online.borrow();
    }

    /// Resolves once the store is online, never returns false while the store lives
    pub async fn wait_online(&self) -> bool {
        let mut rx = self.online.subscribe();
        return rx.wait_for(|online| *online).await.is_ok();
    }

    /// Register settings, existing values are kept. Defaults are not announced
    /// as a change.
    pub fn add_settings(&self, settings: &[Setting]) {
        let mut store = self.write();
        let mut added = false;

        for s in settings {
            if s.min != 0 || s.max != 0 {
                store.limits.insert(s.path.clone(), (s.min, s.max));
            }

            if !store.values.contains_key(&s.path) {
                debug!("Adding setting {} with default {}", s.path, s.default);
                store.values.insert(s.path.clone(), s.default.clone());
                added = true;
            }
        }

        if added {
            store.save();
        }
    }

    pub fn get_value(&self, path: &str) -> Option<Value> {
        return self.read().values.get(path).cloned();
    }

    /// Change a known setting. Unknown paths, a changed value type or an out of
    /// range integer are refused.
    pub fn set_value<V: Into<Value>>(&self, path: &str, value: V) -> bool {
        let value = value.into();
        let mut store = self.write();

        let old = match store.values.get(path) {
            Some(v) => v.clone(),
            None => {
                warn!("Refusing to set unknown setting {path}");
                return false;
            }
        };

        if !same_type(&old, &value) {
            warn!("Refusing {value} for {path}, type does not match {old}");
            return false;
        }

        if let Some((min, max)) = store.limits.get(path) {
            match value.as_i64() {
                Some(v) if v >= *min && v <= *max => {}
                _ => {
                    warn!("Refusing {value} for {path}, allowed is {min}..{max}");
                    return false;
                }
            }
        }

        if old == value {
            return true;
        }

        store.values.insert(path.to_string(), value.clone());
        store.save();
        drop(store);

        /* Nobody listening is fine */
        let _ = self.changes.send(SettingsChange { path: path.to_string(), value });
        return true;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingsChange> {
        return self.changes.subscribe();
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        return LocalSettings::new();
    }
}

fn same_type(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => true,
        (Value::String(_), Value::String(_)) => true,
        (Value::Bool(_), Value::Bool(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position(path: &str) -> Setting {
        return Setting::new(path.to_string(), 0, 0, 2);
    }

    #[test]
    fn test_defaults_are_kept() {
        let s = LocalSettings::new();
        s.add_settings(&[Setting::new("/a".to_string(), "grid:40", 0, 0)]);
        assert!(s.set_value("/a", "acload:41"));
        s.add_settings(&[Setting::new("/a".to_string(), "grid:40", 0, 0)]);
        assert_eq!(s.get_value("/a"), Some(json!("acload:41")));
    }

    #[test]
    fn test_set_value_validation() {
        let s = LocalSettings::new();
        s.add_settings(&[position("/p")]);
        assert!(!s.set_value("/p", 3));
        assert!(!s.set_value("/p", -1));
        assert!(!s.set_value("/p", "1"));
        assert!(!s.set_value("/unknown", 1));
        assert!(s.set_value("/p", 2));
        assert_eq!(s.get_value("/p"), Some(json!(2)));
    }

    #[test]
    fn test_changes_are_announced() {
        let s = LocalSettings::new();
        let mut rx = s.subscribe();
        s.add_settings(&[position("/p")]);
        assert!(rx.try_recv().is_err());

        assert!(s.set_value("/p", 0));
        assert!(rx.try_recv().is_err());

        assert!(s.set_value("/p", 1));
        assert_eq!(rx.try_recv().unwrap(), SettingsChange { path: "/p".to_string(), value: json!(1) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_online() {
        let s = LocalSettings::new();
        assert!(!s.is_online());
        let r = tokio::time::timeout(std::time::Duration::from_secs(1), s.wait_online()).await;
        assert!(r.is_err());

        s.set_online(true);
        assert!(s.wait_online().await);
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("settings.yaml");

        let s = LocalSettings::open(file.clone());
        s.add_settings(&[position("/p")]);
        assert!(s.set_value("/p", 2));
        assert!(dir.path().join("settings.bak").exists());

        let reloaded = LocalSettings::open(file);
        assert_eq!(reloaded.get_value("/p"), Some(json!(2)));
    }
}
