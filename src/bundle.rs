use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display};
use task_protocol::{Codec, CodecError};
use thiserror::Error;
use tracing::debug;

/// Well-known keys of a process bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BundleKey {
    Class,
    Pid,
    State,
    Inputs,
    /// Validated inputs of a started process.
    ProcessInputs,
    Outputs,
    Continuation,
    Termination,
    Exception,
    Ext,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle is missing `{0}`")]
    MissingKey(String),
    #[error("bundle entry `{key}` is malformed: {reason}")]
    Malformed { key: String, reason: String },
    #[error("`{0}` cannot be used as a checkpoint key")]
    InvalidKey(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Portable snapshot of a process: an ordered, nested key/value mapping.
///
/// Equality is structural: nested containers compare by value and key order is
/// irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Bundle(Map<String, Value>);

impl Bundle {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Serialize `value` into the bundle under `key`.
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), BundleError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| BundleError::Malformed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.0.insert(key, value);
        Ok(())
    }

    /// Deserialize the entry under `key`, failing if it is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, BundleError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| BundleError::MissingKey(key.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| BundleError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Like [`Bundle::get_as`] but an absent or null entry yields `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BundleError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get_as(key).map(Some),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A nested bundle stored under `key`.
    pub fn nested(&self, key: &str) -> Option<Bundle> {
        match self.0.get(key) {
            Some(Value::Object(map)) => Some(Bundle(map.clone())),
            _ => None,
        }
    }

    pub fn set_nested(&mut self, key: impl Into<String>, bundle: Bundle) {
        self.0.insert(key.into(), Value::Object(bundle.0));
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn from_value(value: Value) -> Result<Self, BundleError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BundleError::Malformed {
                key: "<root>".into(),
                reason: format!("expected a mapping, got {other}"),
            }),
        }
    }
}

impl From<Map<String, Value>> for Bundle {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Where bundles are checkpointed, keyed by pid and an optional tag.
pub trait BundleStore: Send + Sync {
    fn save(&self, pid: &str, tag: Option<&str>, bundle: &Bundle) -> Result<(), BundleError>;
    fn load(&self, pid: &str, tag: Option<&str>) -> Result<Option<Bundle>, BundleError>;
    /// Drop every checkpoint of `pid`.
    fn delete(&self, pid: &str) -> Result<(), BundleError>;
    fn list(&self) -> Result<Vec<(String, Option<String>)>, BundleError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn BundleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleStore")
         .field("impl", &self.name())
         .finish()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBundleStore {
    bundles: DashMap<(String, Option<String>), Bundle>,
}

impl InMemoryBundleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BundleStore for InMemoryBundleStore {
    fn save(&self, pid: &str, tag: Option<&str>, bundle: &Bundle) -> Result<(), BundleError> {
        self.bundles
            .insert((pid.to_string(), tag.map(str::to_string)), bundle.clone());
        Ok(())
    }

    fn load(&self, pid: &str, tag: Option<&str>) -> Result<Option<Bundle>, BundleError> {
        Ok(self
            .bundles
            .get(&(pid.to_string(), tag.map(str::to_string)))
            .map(|b| b.value().clone()))
    }

    fn delete(&self, pid: &str) -> Result<(), BundleError> {
        self.bundles.retain(|(p, _), _| p != pid);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, Option<String>)>, BundleError> {
        let mut keys: Vec<_> = self.bundles.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "InMemoryBundleStore"
    }
}

/// One file per checkpoint: `<pid>.<ext>` or `<pid>@<tag>.<ext>`.
#[derive(Debug)]
pub struct FileBundleStore {
    dir: PathBuf,
    codec: Arc<dyn Codec>,
}

impl FileBundleStore {
    pub fn new(dir: impl Into<PathBuf>, codec: Arc<dyn Codec>) -> Result<Arc<Self>, BundleError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self { dir, codec }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_key(part: &str) -> Result<(), BundleError> {
        let ok = !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !part.starts_with('.');
        if ok {
            Ok(())
        } else {
            Err(BundleError::InvalidKey(part.to_string()))
        }
    }

    fn path_for(&self, pid: &str, tag: Option<&str>) -> Result<PathBuf, BundleError> {
        Self::check_key(pid)?;
        let stem = match tag {
            Some(tag) => {
                Self::check_key(tag)?;
                format!("{pid}@{tag}")
            }
            None => pid.to_string(),
        };
        Ok(self.dir.join(format!("{stem}.{}", self.codec.name())))
    }

    fn parse_stem(stem: &str) -> (String, Option<String>) {
        match stem.split_once('@') {
            Some((pid, tag)) => (pid.to_string(), Some(tag.to_string())),
            None => (stem.to_string(), None),
        }
    }
}

impl BundleStore for FileBundleStore {
    fn save(&self, pid: &str, tag: Option<&str>, bundle: &Bundle) -> Result<(), BundleError> {
        let path = self.path_for(pid, tag)?;
        let bytes = self.codec.encode(&bundle.to_value())?;
        fs::write(&path, bytes)?;
        debug!("saved checkpoint {}", path.display());
        Ok(())
    }

    fn load(&self, pid: &str, tag: Option<&str>) -> Result<Option<Bundle>, BundleError> {
        let path = self.path_for(pid, tag)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let value = self.codec.decode(&bytes)?;
        Bundle::from_value(value).map(Some)
    }

    fn delete(&self, pid: &str) -> Result<(), BundleError> {
        Self::check_key(pid)?;
        for (p, tag) in self.list()? {
            if p == pid {
                let path = self.path_for(&p, tag.as_deref())?;
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, Option<String>)>, BundleError> {
        let ext = self.codec.name();
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(Self::parse_stem(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "FileBundleStore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use task_protocol::{JsonCodec, YamlCodec};
    use tempfile::TempDir;

    fn sample() -> Bundle {
        let mut b = Bundle::new();
        b.set(BundleKey::Class.as_ref(), json!("echo"));
        b.set(BundleKey::State.as_ref(), json!("waiting"));
        b.set(BundleKey::Outputs.as_ref(), json!({"a": [1, 2, {"b": null}]}));
        let mut ext = Bundle::new();
        ext.set("step", json!(2));
        b.set_nested(BundleKey::Ext.as_ref(), ext);
        b
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let mut a = Bundle::new();
        a.set("x", json!(1));
        a.set("y", json!({"k": [1, 2]}));
        let mut b = Bundle::new();
        b.set("y", json!({"k": [1, 2]}));
        b.set("x", json!(1));
        assert_eq!(a, b);
    }

    #[test]
    fn typed_access_and_nesting() {
        let b = sample();
        let state: String = b.get_as("state").unwrap();
        assert_eq!(state, "waiting");
        assert_eq!(b.nested("ext").unwrap().get("step"), Some(&json!(2)));
        assert!(matches!(b.get_as::<String>("missing"), Err(BundleError::MissingKey(_))));
        assert_eq!(b.get_opt::<String>("missing").unwrap(), None);
        assert!(matches!(b.get_as::<u32>("state"), Err(BundleError::Malformed { .. })));
    }

    #[test]
    fn in_memory_store_keeps_tags_apart() {
        let store = InMemoryBundleStore::new();
        let b = sample();
        store.save("p1", None, &b).unwrap();
        store.save("p1", Some("wait"), &Bundle::new()).unwrap();
        store.save("p2", None, &b).unwrap();

        assert_eq!(store.load("p1", None).unwrap(), Some(b.clone()));
        assert_eq!(store.load("p1", Some("wait")).unwrap(), Some(Bundle::new()));
        assert_eq!(store.load("p1", Some("other")).unwrap(), None);

        store.delete("p1").unwrap();
        assert_eq!(store.list().unwrap(), vec![("p2".to_string(), None)]);
    }

    #[test]
    fn file_store_round_trips_through_both_codecs() {
        for codec in [Arc::new(JsonCodec) as Arc<dyn Codec>, Arc::new(YamlCodec)] {
            let tmp = TempDir::new().unwrap();
            let store = FileBundleStore::new(tmp.path(), codec).unwrap();
            let b = sample();
            store.save("proc-1", None, &b).unwrap();
            store.save("proc-1", Some("checkpoint_a"), &b).unwrap();

            assert_eq!(store.load("proc-1", None).unwrap(), Some(b.clone()));
            assert_eq!(store.load("proc-1", Some("checkpoint_a")).unwrap(), Some(b));
            assert_eq!(store.list().unwrap().len(), 2);

            store.delete("proc-1").unwrap();
            assert!(store.list().unwrap().is_empty());
            assert_eq!(store.load("proc-1", None).unwrap(), None);
        }
    }

    #[test]
    fn file_store_rejects_path_like_pids() {
        let tmp = TempDir::new().unwrap();
        let store = FileBundleStore::new(tmp.path(), Arc::new(JsonCodec)).unwrap();
        let err = store.save("../escape", None, &Bundle::new()).unwrap_err();
        assert!(matches!(err, BundleError::InvalidKey(_)));
    }
}
