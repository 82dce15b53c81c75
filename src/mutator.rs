use std::collections::BTreeMap;

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crd::{CMAudience, CMState, CMStateSpec, CMTemplate, STATE_ANNOTATION};
use crate::error::WebhookError;
use crate::resolver::Resolved;
use crate::store::{StateStore, StoreError};

/// Outcome of one admission decision, before it is wrapped into an
/// `AdmissionResponse`.
#[derive(Debug)]
pub enum Verdict {
    Allow { reason: &'static str },
    Patch(Patch),
    Deny(String),
}

/// Name a Pod is recorded under in an audience: its name, or the
/// `generateName` prefix while the API server has yet to assign one.
pub fn audience_name(pod: &Pod) -> String {
    match pod.metadata.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => pod.metadata.generate_name.clone().unwrap_or_default(),
    }
}

/// Create path: make sure the `CMState` exists, then point the Pod at it.
///
/// `raw` is the object as submitted; the returned patch is computed against it.
pub async fn admit_create<S>(
    store: &S,
    resolved: Resolved,
    pod: &Pod,
    namespace: &str,
    raw: &Value,
) -> Result<Verdict, WebhookError>
where
    S: StateStore + ?Sized,
{
    let Resolved {
        state_name,
        state,
        template,
    } = resolved;

    // An existing state keeps its audience untouched here; only the delete
    // path edits membership of a pre-existing resource.
    if state.is_none() {
        let new_state = build_state(&state_name, namespace, &template, pod);
        match store.create_state(&new_state).await {
            Ok(_) => {
                info!(namespace, cmstate = %state_name, pod = %audience_name(pod), "created cmstate");
            }
            Err(e) => return write_failure(&state_name, "creating cmstate", e),
        }
    }

    let mutated = with_state_annotation(raw, &state_name);
    Ok(Verdict::Patch(json_patch::diff(raw, &mutated)))
}

/// Copy of the submitted object with the tracking annotation set. Edits the
/// raw document so fields unknown to the typed `Pod` survive untouched.
fn with_state_annotation(raw: &Value, state_name: &str) -> Value {
    let mut mutated = raw.clone();
    mutated["metadata"]["annotations"][STATE_ANNOTATION] = Value::String(state_name.to_string());
    mutated
}

/// Delete path: drop the Pod from the audience of an existing `CMState`.
pub async fn admit_delete<S>(
    store: &S,
    resolved: Resolved,
    pod: &Pod,
    namespace: &str,
) -> Result<Verdict, WebhookError>
where
    S: StateStore + ?Sized,
{
    let Some(state) = resolved.state else {
        return Ok(Verdict::Allow {
            reason: "skipping cmstate patch due to missing cmstate",
        });
    };

    let pod_name = audience_name(pod);
    let Some(audience) = without_member(&state.spec.audience, &pod_name) else {
        return Ok(Verdict::Allow {
            reason: "skipping cmstate patch due to pod not in audience",
        });
    };

    match store
        .patch_audience(namespace, &resolved.state_name, &audience)
        .await
    {
        Ok(()) => {
            info!(
                namespace,
                cmstate = %resolved.state_name,
                pod = %pod_name,
                remaining = audience.len(),
                "removed pod from cmstate audience"
            );
            Ok(Verdict::Allow {
                reason: "cmstate has been patched, no need to mutate pod",
            })
        }
        Err(e) => write_failure(&resolved.state_name, "patching cmstate", e),
    }
}

/// A timed-out write is an internal error; any other write failure blocks the
/// Pod operation.
fn write_failure(state_name: &str, action: &str, err: StoreError) -> Result<Verdict, WebhookError> {
    if err.is_timeout() {
        return Err(WebhookError::StateWriteTimeout {
            name: state_name.to_string(),
            source: err,
        });
    }
    warn!(cmstate = %state_name, "{action} has resulted in an error: {err}");
    Ok(Verdict::Deny(format!(
        "{action} '{state_name}' has resulted in an error: {err}"
    )))
}

/// Audience without the entry named `name`, or `None` if there is no such entry.
fn without_member(audience: &[CMAudience], name: &str) -> Option<Vec<CMAudience>> {
    let index = audience.iter().position(|member| member.name == name)?;
    debug!(index, member = name, "found pod in cmstate audience");
    Some(
        audience
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, member)| member.clone())
            .collect(),
    )
}

fn build_state(name: &str, namespace: &str, template: &CMTemplate, pod: &Pod) -> CMState {
    let annotations = pod.annotations();
    let labels: BTreeMap<String, String> = template
        .spec
        .template
        .annotation_replace
        .keys()
        .filter_map(|key| annotations.get(key).map(|value| (key.clone(), value.clone())))
        .collect();

    CMState {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: CMStateSpec {
            audience: vec![CMAudience::pod(audience_name(pod))],
            cmtemplate: template.name_any(),
        },
    }
}
