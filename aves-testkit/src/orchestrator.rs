use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use aves::*;
use parking_lot::Mutex;

/// An object held by [`MockOrchestrator`].
#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub manifest: Manifest,
}

impl StoredObject {
    fn matches(&self, kind: ResourceKind, namespace: &str, selector: &LabelSelector) -> bool {
        self.kind == kind
            && self.namespace == namespace
            && selector
                .0
                .iter()
                .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OrchestratorCall {
    Create { kind: ResourceKind, name: String },
    Delete { kind: ResourceKind, selector: String },
    List { kind: ResourceKind, selector: String },
}

#[derive(Default)]
struct MockState {
    objects: Vec<StoredObject>,
    calls: Vec<OrchestratorCall>,
    fail_create: HashMap<ResourceKind, OrchestratorError>,
    fail_delete: Option<OrchestratorError>,
    fail_delete_kind: HashMap<ResourceKind, OrchestratorError>,
    fail_create_name: Option<(String, OrchestratorError)>,
}

/// In-memory orchestrator that records every call and can be told to fail.
#[derive(Clone, Default)]
pub struct MockOrchestrator {
    state: Arc<Mutex<MockState>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OrchestratorCall> {
        self.state.lock().calls.clone()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.state.lock().objects.clone()
    }

    pub fn objects_of(&self, kind: ResourceKind) -> Vec<StoredObject> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|object| object.kind == kind)
            .cloned()
            .collect()
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .objects
            .iter()
            .find(|object| object.kind == kind && object.name == name)
            .cloned()
    }

    pub fn create_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, OrchestratorCall::Create { .. }))
            .count()
    }

    /// Fail every create of `kind` with `error`.
    pub fn fail_create(&self, kind: ResourceKind, error: OrchestratorError) {
        self.state.lock().fail_create.insert(kind, error);
    }

    /// Fail the create of the object named `name`.
    pub fn fail_create_named(&self, name: &str, error: OrchestratorError) {
        self.state.lock().fail_create_name = Some((name.to_string(), error));
    }

    /// Fail every delete with `error`.
    pub fn fail_delete(&self, error: OrchestratorError) {
        self.state.lock().fail_delete = Some(error);
    }

    /// Fail deletes of `kind` with `error`.
    pub fn fail_delete_kind(&self, kind: ResourceKind, error: OrchestratorError) {
        self.state.lock().fail_delete_kind.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_create.clear();
        state.fail_delete = None;
        state.fail_delete_kind.clear();
        state.fail_create_name = None;
    }

    /// Drop every object without recording a call, as if removed out of band.
    pub fn remove_all(&self) {
        self.state.lock().objects.clear();
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

fn manifest_labels(manifest: &Manifest) -> BTreeMap<String, String> {
    manifest.body["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create(&self, namespace: &str, manifest: &Manifest) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock();
        state.calls.push(OrchestratorCall::Create {
            kind: manifest.kind,
            name: manifest.name.clone(),
        });
        if let Some(error) = state.fail_create.get(&manifest.kind) {
            return Err(error.clone());
        }
        if let Some((name, error)) = &state.fail_create_name {
            if *name == manifest.name {
                return Err(error.clone());
            }
        }
        if state
            .objects
            .iter()
            .any(|o| o.kind == manifest.kind && o.namespace == namespace && o.name == manifest.name)
        {
            return Err(OrchestratorError::new(
                Some(409),
                format!("{} {} already exists", manifest.kind, manifest.name),
            ));
        }
        state.objects.push(StoredObject {
            kind: manifest.kind,
            namespace: namespace.to_string(),
            name: manifest.name.clone(),
            labels: manifest_labels(manifest),
            manifest: manifest.clone(),
        });
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock();
        state.calls.push(OrchestratorCall::Delete {
            kind,
            selector: selector.to_string(),
        });
        if let Some(error) = state.fail_delete.as_ref().or(state.fail_delete_kind.get(&kind)) {
            return Err(error.clone());
        }
        state
            .objects
            .retain(|object| !object.matches(kind, namespace, selector));
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut state = self.state.lock();
        state.calls.push(OrchestratorCall::List {
            kind,
            selector: selector.to_string(),
        });
        Ok(state
            .objects
            .iter()
            .filter(|object| object.matches(kind, namespace, selector))
            .map(|object| object.name.clone())
            .collect())
    }
}
