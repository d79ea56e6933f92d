//! In-memory [`Cluster`] for reconcile tests

use super::{Cluster, OwnedKind, OwnedObject, OwnerKey, OwnerKind};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type ObjectKey = (OwnedKind, String, String);
type OwnerId = (OwnerKind, String, String);

#[derive(Debug, Clone)]
pub struct OwnerRecord {
    pub uid: String,
    pub deleting: bool,
    pub finalizers: Vec<String>,
    pub status: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub selector: String,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    owners: BTreeMap<OwnerId, OwnerRecord>,
    writes: Vec<(OwnedKind, String)>,
    deletes: Vec<(OwnedKind, String)>,
    execs: Vec<ExecCall>,
    status_patches: usize,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    failing_applies: AtomicUsize,
    exec_successes: AtomicUsize,
}

fn owner_id(owner: &OwnerKey) -> OwnerId {
    (owner.kind, owner.namespace.clone(), owner.name.clone())
}

/// RFC 7386 merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(existing) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        existing.remove(key);
                    } else {
                        merge_patch(existing.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = &object["metadata"]["labels"];
    selector
        .split(',')
        .filter(|c| !c.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((k, v)) => labels[k].as_str() == Some(v),
            None => false,
        })
}

/// The subset of RFC 6902 the finalizer patches use. Operations apply all or
/// nothing; `Err` describes the first one that failed.
fn apply_finalizer_patch(
    finalizers: &mut Vec<String>,
    patch: &Value,
) -> std::result::Result<(), String> {
    let ops = patch.as_array().ok_or("patch is not an array")?;
    let mut next = finalizers.clone();
    for op in ops {
        let path = op["path"].as_str().unwrap_or_default();
        let target = path
            .strip_prefix("/metadata/finalizers")
            .ok_or_else(|| format!("unsupported path {path}"))?;
        let index = || {
            target
                .strip_prefix('/')
                .and_then(|i| i.parse::<usize>().ok())
                .ok_or_else(|| format!("bad index in {path}"))
        };
        match (op["op"].as_str().unwrap_or_default(), target) {
            ("test", "") => {
                let current = if next.is_empty() {
                    Value::Null
                } else {
                    json!(next)
                };
                if current != op["value"] {
                    return Err(format!("test of {path} failed"));
                }
            }
            ("test", _) => {
                if next.get(index()?).map(String::as_str) != op["value"].as_str() {
                    return Err(format!("test of {path} failed"));
                }
            }
            ("add", "") => {
                next = serde_json::from_value(op["value"].clone()).map_err(|e| e.to_string())?;
            }
            ("add", "/-") => next.push(op["value"].as_str().unwrap_or_default().to_string()),
            ("remove", _) => {
                let i = index()?;
                if i >= next.len() {
                    return Err(format!("nothing to remove at {path}"));
                }
                next.remove(i);
            }
            (other, _) => return Err(format!("unsupported operation {other} on {path}")),
        }
    }
    *finalizers = next;
    Ok(())
}

impl MemoryCluster {
    pub fn new() -> Self {
        let cluster = Self::default();
        cluster.exec_successes.store(1, Ordering::SeqCst);
        cluster
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn register_owner(&self, owner: &OwnerKey) {
        self.lock().owners.insert(
            owner_id(owner),
            OwnerRecord {
                uid: owner.uid.clone(),
                deleting: false,
                finalizers: vec![],
                status: Value::Null,
            },
        );
    }

    pub fn mark_deleting(&self, owner: &OwnerKey) {
        if let Some(record) = self.lock().owners.get_mut(&owner_id(owner)) {
            record.deleting = true;
        }
    }

    /// Another writer replacing the owner's finalizers
    pub fn set_finalizers(&self, owner: &OwnerKey, finalizers: Vec<String>) {
        if let Some(record) = self.lock().owners.get_mut(&owner_id(owner)) {
            record.finalizers = finalizers;
        }
    }

    /// `None` once the owner has been fully removed
    pub fn owner(&self, owner: &OwnerKey) -> Option<OwnerRecord> {
        self.lock().owners.get(&owner_id(owner)).cloned()
    }

    pub fn status(&self, owner: &OwnerKey) -> Value {
        self.owner(owner).map(|o| o.status).unwrap_or(Value::Null)
    }

    pub fn object(&self, namespace: &str, kind: OwnedKind, name: &str) -> Option<OwnedObject> {
        let value = self
            .lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()?;
        OwnedObject::from_json(kind, value).ok()
    }

    pub fn names(&self, kind: OwnedKind) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn writes(&self) -> Vec<(OwnedKind, String)> {
        self.lock().writes.clone()
    }

    pub fn deletes(&self) -> Vec<(OwnedKind, String)> {
        self.lock().deletes.clone()
    }

    pub fn status_patches(&self) -> usize {
        self.lock().status_patches
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.lock().execs.clone()
    }

    /// Number of pods reported as having run an exec successfully
    pub fn set_exec_successes(&self, pods: usize) {
        self.exec_successes.store(pods, Ordering::SeqCst);
    }

    /// Make the next `n` applies fail with a server error
    pub fn fail_next_applies(&self, n: usize) {
        self.failing_applies.store(n, Ordering::SeqCst);
    }

    /// Modify a stored object out of band (manual edits, drift)
    pub fn edit(&self, namespace: &str, kind: OwnedKind, name: &str, f: impl FnOnce(&mut Value)) {
        if let Some(value) = self
            .lock()
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            f(value);
        }
    }

    /// Report every Deployment as fully rolled out
    pub fn mark_deployments_ready(&self) {
        let mut state = self.lock();
        for ((kind, _, _), value) in state.objects.iter_mut() {
            if *kind == OwnedKind::Deployment {
                let replicas = value["spec"]["replicas"].as_i64().unwrap_or(1);
                value["status"] = json!({
                    "replicas": replicas,
                    "readyReplicas": replicas,
                    "availableReplicas": replicas,
                });
            }
        }
    }

    /// Garbage-collect everything whose owner reference points at `uid`
    pub fn collect_garbage(&self, uid: &str) -> usize {
        let mut state = self.lock();
        let before = state.objects.len();
        state.objects.retain(|_, value| {
            !value["metadata"]["ownerReferences"]
                .as_array()
                .is_some_and(|refs| refs.iter().any(|r| r["uid"].as_str() == Some(uid)))
        });
        before - state.objects.len()
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get(
        &self,
        namespace: &str,
        kind: OwnedKind,
        name: &str,
    ) -> Result<Option<OwnedObject>> {
        let value = self
            .lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned();
        value.map(|v| OwnedObject::from_json(kind, v)).transpose()
    }

    async fn apply(&self, namespace: &str, object: &OwnedObject) -> Result<()> {
        let failing = self.failing_applies.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_applies.store(failing - 1, Ordering::SeqCst);
            return Err(Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "injected failure".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })));
        }

        let desired = object.to_json()?;
        let mut state = self.lock();
        let key = (object.kind(), namespace.to_string(), object.name());
        let entry = state.objects.entry(key).or_insert(Value::Null);
        merge_patch(entry, &desired);
        state.writes.push((object.kind(), object.name()));
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: OwnedKind, name: &str) -> Result<bool> {
        let mut state = self.lock();
        let removed = state
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some();
        if removed {
            state.deletes.push((kind, name.to_string()));
        }
        Ok(removed)
    }

    async fn list_metadata(
        &self,
        namespace: &str,
        kind: OwnedKind,
        label_selector: &str,
    ) -> Result<Vec<ObjectMeta>> {
        let matching: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && ns == namespace && matches_selector(value, label_selector)
            })
            .map(|(_, value)| value["metadata"].clone())
            .collect();
        Ok(matching
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn owner_deleting(&self, owner: &OwnerKey) -> Result<bool> {
        Ok(match self.lock().owners.get(&owner_id(owner)) {
            None => true,
            Some(record) => record.deleting || record.uid != owner.uid,
        })
    }

    async fn patch_status(&self, owner: &OwnerKey, status: Value) -> Result<()> {
        let mut state = self.lock();
        state.status_patches += 1;
        if let Some(record) = state.owners.get_mut(&owner_id(owner)) {
            merge_patch(&mut record.status, &status);
        }
        Ok(())
    }

    async fn patch_finalizers(&self, owner: &OwnerKey, patch: Value) -> Result<()> {
        let mut state = self.lock();
        let id = owner_id(owner);
        let release = match state.owners.get_mut(&id) {
            Some(record) => {
                apply_finalizer_patch(&mut record.finalizers, &patch)
                    .map_err(|reason| Error::Conflict(format!("finalizers of {owner}: {reason}")))?;
                record.deleting && record.finalizers.is_empty()
            }
            None => false,
        };
        if release {
            state.owners.remove(&id);
        }
        Ok(())
    }

    async fn exec_in_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<usize> {
        self.lock().execs.push(ExecCall {
            namespace: namespace.to_string(),
            selector: label_selector.to_string(),
            container: container.to_string(),
            command,
        });
        Ok(self.exec_successes.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::cluster::{add_finalizer_patch, remove_finalizer_patch};

    #[test]
    fn merge_patch_removes_nulls_and_replaces_arrays() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2]});
        merge_patch(&mut target, &json!({"a": {"c": null, "d": 3}, "list": [3]}));
        assert_eq!(target, json!({"a": {"b": 1, "d": 3}, "list": [3]}));
    }

    #[test]
    fn finalizer_patches_do_not_clobber_other_writers() {
        let ours = "apps.example.com/ours".to_string();
        let theirs = "other.example.com/theirs".to_string();
        let mut finalizers = vec![];
        apply_finalizer_patch(&mut finalizers, &add_finalizer_patch(&[], &ours)).unwrap();
        assert_eq!(finalizers, vec![ours.clone()]);

        // Another controller adds its finalizer after our read
        finalizers.push(theirs.clone());
        let stale_add = add_finalizer_patch(&[ours.clone()], "apps.example.com/late");
        assert!(apply_finalizer_patch(&mut finalizers, &stale_add).is_err());
        assert_eq!(finalizers, vec![ours.clone(), theirs.clone()]);

        let remove = remove_finalizer_patch(&[ours.clone()], &ours).unwrap();
        apply_finalizer_patch(&mut finalizers, &remove).unwrap();
        assert_eq!(finalizers, vec![theirs.clone()]);

        // Ours is gone; removing it again at the old index must not drop theirs
        assert!(apply_finalizer_patch(&mut finalizers, &remove).is_err());
        assert_eq!(finalizers, vec![theirs]);
    }

    #[test]
    fn selector_requires_every_label() {
        let object = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        assert!(matches_selector(&object, "a=1,b=2"));
        assert!(!matches_selector(&object, "a=1,b=3"));
    }
}
