//! Mock object store for unit testing
//!
//! Keeps objects in memory as JSON and enforces `resourceVersion` checks on
//! replace, like an API server would. Tests can inject update conflicts and
//! hard failures to exercise the reconciler's retry paths.

use crate::error::StoreError;
use crate::kind::{ManagedKind, describe};
use crate::store::ObjectStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

type ObjectKey = (String, String, String);

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<ObjectKey, Value>,
    next_resource_version: u64,
    pending_conflicts: u32,
    failing: HashMap<String, String>,
    creates: usize,
    replaces: usize,
}

impl MockState {
    fn bump(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

/// In-memory [`ObjectStore`]
#[derive(Clone, Debug, Default)]
pub struct MockObjectStore {
    state: Arc<Mutex<MockState>>,
}

fn key<K: ManagedKind>(namespace: Option<&str>, name: &str) -> ObjectKey {
    let ns = if K::NAMESPACED { namespace.unwrap_or_default() } else { "" };
    (K::kind(&()).into_owned(), ns.to_string(), name.to_string())
}

fn set_metadata(value: &mut Value, field: &str, content: Value) {
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(field.to_string(), content);
    }
}

fn metadata_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get("metadata")?.get(field)?.as_str()
}

impl MockObjectStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing all checks (for test setup)
    pub fn insert<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) {
        let mut state = self.state.lock().unwrap();
        let name = object.meta().name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(object).unwrap();
        let rv = state.bump();
        set_metadata(&mut value, "resourceVersion", Value::String(rv));
        state.objects.insert(key::<K>(namespace, &name), value);
    }

    /// Read an object without going through the trait (for assertions)
    pub fn object<K: ManagedKind>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Names of all stored objects of kind `K`, sorted
    pub fn names<K: ManagedKind>(&self) -> Vec<String> {
        let kind = K::kind(&()).into_owned();
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Make the next `count` replace calls fail with a conflict, as if another
    /// writer updated the object in between.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().unwrap().pending_conflicts = count;
    }

    /// Make every call touching an object named `name` fail
    pub fn inject_error(&self, name: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(name.to_string(), message.to_string());
    }

    /// Number of successful create calls
    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    /// Number of successful replace calls
    pub fn replaces(&self) -> usize {
        self.state.lock().unwrap().replaces
    }

    /// Number of successful writes of any kind
    pub fn writes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.creates + state.replaces
    }

    fn check_failure(state: &MockState, name: &str) -> Result<(), StoreError> {
        match state.failing.get(name) {
            Some(message) => Err(StoreError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockObjectStore {
    async fn get<K: ManagedKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, name)?;
        state
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .transpose()
    }

    async fn create<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let name = object.meta().name.clone().unwrap_or_default();
        Self::check_failure(&state, &name)?;
        let key = key::<K>(namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(describe::<K>(namespace, &name)));
        }
        let mut value = serde_json::to_value(object)?;
        let rv = state.bump();
        set_metadata(&mut value, "resourceVersion", Value::String(rv.clone()));
        set_metadata(&mut value, "uid", Value::String(format!("uid-{rv}")));
        if K::NAMESPACED {
            set_metadata(&mut value, "namespace", Value::String(key.1.clone()));
        }
        let created = serde_json::from_value(value.clone())?;
        state.objects.insert(key, value);
        state.creates += 1;
        Ok(created)
    }

    async fn replace<K: ManagedKind>(&self, namespace: Option<&str>, object: &K) -> Result<K, StoreError> {
        let mut state = self.state.lock().unwrap();
        let name = object.meta().name.clone().unwrap_or_default();
        Self::check_failure(&state, &name)?;
        let key = key::<K>(namespace, &name);
        let what = describe::<K>(namespace, &name);

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            let rv = state.bump();
            if let Some(stored) = state.objects.get_mut(&key) {
                set_metadata(stored, "resourceVersion", Value::String(rv));
            }
            return Err(StoreError::Conflict(what));
        }

        let Some(stored) = state.objects.get(&key) else {
            return Err(StoreError::NotFound(what));
        };
        if metadata_str(stored, "resourceVersion") != object.meta().resource_version.as_deref() {
            return Err(StoreError::Conflict(what));
        }
        let status = stored.get("status").cloned();
        let uid = stored.get("metadata").and_then(|m| m.get("uid")).cloned();

        let mut value = serde_json::to_value(object)?;
        if let Some(map) = value.as_object_mut() {
            match status {
                Some(status) => map.insert("status".to_string(), status),
                None => map.remove("status"),
            };
        }
        if let Some(uid) = uid {
            set_metadata(&mut value, "uid", uid);
        }
        let rv = state.bump();
        set_metadata(&mut value, "resourceVersion", Value::String(rv));
        let replaced = serde_json::from_value(value.clone())?;
        state.objects.insert(key, value);
        state.replaces += 1;
        Ok(replaced)
    }
}
