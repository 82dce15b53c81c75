use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, Operation};
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::{debug, warn};

use crate::crd::TEMPLATE_ANNOTATION;
use crate::error::WebhookError;
use crate::mutator::{self, Verdict};
use crate::resolver;
use crate::store::StateStore;

/// Admission operations the webhook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodOperation {
    Create,
    Delete,
}

impl PodOperation {
    pub fn from_admission(operation: &Operation) -> Option<Self> {
        match operation {
            Operation::Create => Some(PodOperation::Create),
            Operation::Delete => Some(PodOperation::Delete),
            _ => None,
        }
    }
}

/// A Pod admission decoded from the review envelope.
pub struct PodAdmission {
    pub pod: Pod,
    /// The object exactly as submitted, for patch computation.
    pub raw: Value,
    pub namespace: String,
}

impl PodAdmission {
    /// Decodes `object`, or `oldObject` for deletions where the API server
    /// sends only the latter.
    pub fn decode(req: &AdmissionRequest<DynamicObject>) -> Result<Self, WebhookError> {
        let object = req
            .object
            .as_ref()
            .or(req.old_object.as_ref())
            .ok_or(WebhookError::MissingObject)?;

        let raw = serde_json::to_value(object).map_err(WebhookError::Decode)?;
        let pod: Pod = serde_json::from_value(raw.clone()).map_err(WebhookError::Decode)?;

        let namespace = pod
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| req.namespace.clone())
            .unwrap_or_default();

        Ok(Self {
            pod,
            raw,
            namespace,
        })
    }

    /// Value of the template annotation, if set to something non-empty.
    pub fn template(&self) -> Option<&str> {
        self.pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(TEMPLATE_ANNOTATION))
            .map(String::as_str)
            .filter(|t| !t.is_empty())
    }
}

/// Runs one admission request through decode, resolve and mutate.
pub async fn admit<S>(
    store: &S,
    req: &AdmissionRequest<DynamicObject>,
) -> Result<Verdict, WebhookError>
where
    S: StateStore + ?Sized,
{
    let admission = PodAdmission::decode(req)?;

    let Some(template) = admission.template() else {
        return Ok(Verdict::Allow {
            reason: "skipping cmstate check due to missing annotation",
        });
    };

    let Some(operation) = PodOperation::from_admission(&req.operation) else {
        warn!(uid = %req.uid, operation = ?req.operation, "ignoring unsupported admission operation");
        return Ok(Verdict::Allow {
            reason: "skipping cmstate check for unsupported operation",
        });
    };

    let resolved = resolver::resolve(store, &admission.namespace, template).await?;
    debug!(
        uid = %req.uid,
        cmstate = %resolved.state_name,
        exists = resolved.state.is_some(),
        "resolved cmstate"
    );

    match operation {
        PodOperation::Create => {
            mutator::admit_create(
                store,
                resolved,
                &admission.pod,
                &admission.namespace,
                &admission.raw,
            )
            .await
        }
        PodOperation::Delete => {
            mutator::admit_delete(store, resolved, &admission.pod, &admission.namespace).await
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn pod(name: &str, template: Option<&str>) -> Value {
        let mut annotations = json!({ "team": "payments" });
        if let Some(template) = template {
            annotations["cache.spices.dev/cmtemplate"] = json!(template);
        }
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "ns",
                "annotations": annotations
            },
            "spec": { "containers": [{ "name": "app", "image": "nginx:1.27" }] }
        })
    }

    /// `admission.k8s.io/v1` review as the API server sends it. Deletions
    /// carry the Pod in `oldObject` only.
    pub fn review(operation: &str, pod: Value) -> Value {
        let (object, old_object) = if operation == "DELETE" {
            (Value::Null, pod)
        } else {
            (pod, Value::Null)
        };
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "app-1",
                "namespace": "ns",
                "operation": operation,
                "userInfo": { "username": "system:serviceaccount:kube-system:replicaset-controller" },
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
                "options": null
            }
        })
    }
}
