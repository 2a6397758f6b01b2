//! An in-memory cluster store for tests.
//!
//! Records every call, enforces resource versions on replace, fills in a few
//! server side defaults, completes deletion once the last finalizer is gone and
//! garbage collects dependents by owner reference the way the api server does.

use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;
use kube::core::ErrorResponse;
use serde_json::{json, Value};

use super::{ClusterApi, ClusterResource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Replace,
    PatchStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    failures: Vec<(Verb, String, ErrorResponse)>,
    version: u64,
}

#[derive(Default)]
pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    })
}

fn key<K: ClusterResource>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.into(), name.into())
}

fn default_field(object: &mut Value, field: &str, default: Value) {
    if let Some(object) = object.as_object_mut() {
        object.entry(field).or_insert(default);
    }
}

/// Fill in some of the defaults the api server adds on admission.
fn apply_defaults(kind: &str, value: &mut Value) {
    let Some(spec) = value.get_mut("spec") else {
        return;
    };

    match kind {
        "Service" => {
            default_field(spec, "type", json!("ClusterIP"));
            default_field(spec, "sessionAffinity", json!("None"));
        }
        "Deployment" => {
            default_field(spec, "revisionHistoryLimit", json!(10));
            default_field(spec, "progressDeadlineSeconds", json!(600));

            let Some(pod) = spec.get_mut("template").and_then(|t| t.get_mut("spec")) else {
                return;
            };
            default_field(pod, "dnsPolicy", json!("ClusterFirst"));
            default_field(pod, "schedulerName", json!("default-scheduler"));
            default_field(pod, "terminationGracePeriodSeconds", json!(30));

            for list in ["initContainers", "containers"] {
                let Some(containers) = pod.get_mut(list).and_then(Value::as_array_mut) else {
                    continue;
                };
                for container in containers {
                    default_field(container, "imagePullPolicy", json!("IfNotPresent"));
                    default_field(container, "terminationMessagePath", json!("/dev/termination-log"));
                    default_field(container, "terminationMessagePolicy", json!("File"));

                    let env = container.get_mut("env").and_then(Value::as_array_mut);
                    for var in env.into_iter().flatten() {
                        if let Some(field_ref) = var
                            .get_mut("valueFrom")
                            .and_then(|v| v.get_mut("fieldRef"))
                        {
                            default_field(field_ref, "apiVersion", json!("v1"));
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

impl Inner {
    fn record<K: ClusterResource>(&mut self, verb: Verb, name: &str) -> Result<(), kube::Error> {
        let kind = K::kind(&()).to_string();
        self.calls.push(Call {
            verb,
            kind: kind.clone(),
            name: name.into(),
        });

        match self
            .failures
            .iter()
            .position(|(v, k, _)| *v == verb && *k == kind)
        {
            Some(index) => Err(kube::Error::Api(self.failures.remove(index).2)),
            None => Ok(()),
        }
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn stamp(&mut self, object: &mut Value) {
        let version = self.next_version();
        object["metadata"]["resourceVersion"] = json!(version);
        if object["metadata"]["uid"].is_null() {
            object["metadata"]["uid"] = json!(format!("uid-{version}"));
        }
    }

    /// Remove an object and everything it owns.
    fn collect(&mut self, key: &Key) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = removed["metadata"]["uid"].as_str().map(String::from) else {
            return;
        };

        let owned: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, object)| {
                object["metadata"]["ownerReferences"]
                    .as_array()
                    .map(|refs| refs.iter().any(|r| r["uid"] == uid.as_str()))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            self.collect(&key);
        }
    }

    fn finalizers_done(object: &Value) -> bool {
        !object["metadata"]["deletionTimestamp"].is_null()
            && object["metadata"]["finalizers"]
                .as_array()
                .map(Vec::is_empty)
                .unwrap_or(true)
    }
}

impl InMemoryCluster {
    /// Seed an object without recording a call.
    pub fn insert<K: ClusterResource>(&self, object: &K) -> K {
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(object).unwrap();
        inner.stamp(&mut value);

        let namespace = value["metadata"]["namespace"].as_str().unwrap().to_string();
        let name = value["metadata"]["name"].as_str().unwrap().to_string();
        inner
            .objects
            .insert(key::<K>(&namespace, &name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Read an object without recording a call.
    pub fn object<K: ClusterResource>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Request deletion the way `kubectl delete` would.
    pub fn delete<K: ClusterResource>(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = key::<K>(namespace, name);
        let Some(object) = inner.objects.get_mut(&key) else {
            return;
        };
        object["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");

        if Inner::finalizers_done(object) {
            inner.collect(&key);
        }
    }

    /// Make the next matching call fail with the given status.
    pub fn fail_next(&self, verb: Verb, kind: &str, code: u16, reason: &str) {
        self.inner.lock().unwrap().failures.push((
            verb,
            kind.into(),
            ErrorResponse {
                status: "Failure".into(),
                message: format!("injected {reason}"),
                reason: reason.into(),
                code,
            },
        ));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Every recorded call that writes to the store.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb != Verb::Get)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, kube::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record::<K>(Verb::Get, name)?;

        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(|value| serde_json::from_value(value.clone()).map_err(kube::Error::SerdeError))
            .transpose()
    }

    async fn create<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.record::<K>(Verb::Create, &name)?;

        let key = key::<K>(namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name:?} already exists")));
        }

        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        value["metadata"]["namespace"] = json!(namespace);
        inner.stamp(&mut value);
        if key.0 == "Service" && value["spec"]["clusterIP"].is_null() {
            let ip = format!("10.96.0.{}", inner.version);
            value["spec"]["clusterIP"] = json!(ip);
        }
        apply_defaults(&key.0, &mut value);

        inner.objects.insert(key, value.clone());
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn replace<K: ClusterResource>(
        &self,
        namespace: &str,
        object: &K,
    ) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.record::<K>(Verb::Replace, &name)?;

        let key = key::<K>(namespace, &name);
        let Some(current) = inner.objects.get(&key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name:?} not found")));
        };

        let mut value = serde_json::to_value(object).map_err(kube::Error::SerdeError)?;
        let expected = &value["metadata"]["resourceVersion"];
        if !expected.is_null() && *expected != current["metadata"]["resourceVersion"] {
            return Err(api_error(409, "Conflict", format!("{name:?} was modified")));
        }

        // uid, deletion and status are owned by the store
        value["metadata"]["uid"] = current["metadata"]["uid"].clone();
        value["metadata"]["deletionTimestamp"] = current["metadata"]["deletionTimestamp"].clone();
        value["status"] = current["status"].clone();
        inner.stamp(&mut value);
        apply_defaults(&key.0, &mut value);

        let done = Inner::finalizers_done(&value);
        inner.objects.insert(key.clone(), value.clone());
        if done {
            inner.collect(&key);
        }
        serde_json::from_value(value).map_err(kube::Error::SerdeError)
    }

    async fn patch_status<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        status: Value,
    ) -> Result<K, kube::Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.record::<K>(Verb::PatchStatus, name)?;
        let version = inner.next_version();

        let Some(current) = inner.objects.get_mut(&key::<K>(namespace, name)) else {
            return Err(api_error(404, "NotFound", format!("{name:?} not found")));
        };
        if !current["status"].is_object() {
            current["status"] = json!({});
        }
        if let (Some(target), Some(patch)) = (current["status"].as_object_mut(), status.as_object())
        {
            for (field, value) in patch {
                target.insert(field.clone(), value.clone());
            }
        }
        current["metadata"]["resourceVersion"] = json!(version);

        serde_json::from_value(current.clone()).map_err(kube::Error::SerdeError)
    }
}
