use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tracing::{debug, error, info, warn};

use crate::admission;
use crate::crd::{CMAudience, CMState, CMTemplate};
use crate::metrics::{InjectorMetrics, RequestLabels, ResponseLabels};
use crate::mutator::Verdict;
use crate::store::{StateStore, StoreError};

pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub metrics: InjectorMetrics,
}

pub type SharedState = Arc<AppState>;

/// HTTP status reported in `response.status.code` for internal errors.
const INTERNAL_ERROR_CODE: u16 = 500;

pub async fn handle_mutate(
    State(state): State<SharedState>,
    body: Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let start = Instant::now();

    let review: AdmissionReview<DynamicObject> = match serde_json::from_value(body.0) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to deserialize AdmissionReview: {e}");
            let resp = AdmissionResponse::invalid(format!("failed to deserialize request: {e}"));
            return review_to_json(resp.into_review());
        }
    };

    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            warn!("AdmissionReview missing request field: {e}");
            let resp = AdmissionResponse::invalid("missing request field in AdmissionReview");
            return review_to_json(resp.into_review());
        }
    };

    let operation = format!("{:?}", req.operation).to_uppercase();
    state
        .metrics
        .admission_requests_total
        .get_or_create(&RequestLabels {
            operation: operation.clone(),
        })
        .inc();

    let store = MeteredStore {
        inner: state.store.as_ref(),
        metrics: &state.metrics,
    };
    let (response, outcome) = match admission::admit(&store, &req).await {
        Ok(verdict) => build_response(&req, verdict),
        Err(e) => {
            error!(uid = %req.uid, %operation, "{e}");
            (errored(&req, e), "errored")
        }
    };

    state
        .metrics
        .admission_responses_total
        .get_or_create(&ResponseLabels {
            operation: operation.clone(),
            outcome,
        })
        .inc();
    state
        .metrics
        .admission_request_duration_seconds
        .get_or_create(&RequestLabels { operation })
        .observe(start.elapsed().as_secs_f64());

    review_to_json(response.into_review())
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(review).expect("AdmissionReview serialization is infallible"))
}

fn build_response(
    req: &AdmissionRequest<DynamicObject>,
    verdict: Verdict,
) -> (AdmissionResponse, &'static str) {
    let resp = AdmissionResponse::from(req);
    match verdict {
        Verdict::Allow { reason } => {
            debug!(uid = %req.uid, reason, "allowed");
            (resp, "allowed")
        }
        Verdict::Deny(reason) => {
            info!(uid = %req.uid, %reason, "denied");
            (resp.deny(reason), "denied")
        }
        Verdict::Patch(patch) => match resp.with_patch(patch) {
            Ok(patched) => (patched, "patched"),
            Err(e) => {
                error!(uid = %req.uid, "failed to serialize patch: {e}");
                (
                    errored(req, format!("failed to serialize patch: {e}")),
                    "errored",
                )
            }
        },
    }
}

/// Rejection carrying an internal-error status, as opposed to a policy denial.
fn errored(req: &AdmissionRequest<DynamicObject>, err: impl ToString) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req).deny(err.to_string());
    resp.result.code = INTERNAL_ERROR_CODE;
    resp
}

/// Counts successful writes on their way to the backing store.
struct MeteredStore<'a> {
    inner: &'a dyn StateStore,
    metrics: &'a InjectorMetrics,
}

#[async_trait]
impl<'a> StateStore for MeteredStore<'a> {
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, StoreError> {
        self.inner.get_state(namespace, name).await
    }

    async fn get_template(&self, name: &str) -> Result<Option<CMTemplate>, StoreError> {
        self.inner.get_template(name).await
    }

    async fn create_state(&self, state: &CMState) -> Result<CMState, StoreError> {
        let created = self.inner.create_state(state).await?;
        self.metrics.states_created_total.inc();
        Ok(created)
    }

    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: &[CMAudience],
    ) -> Result<(), StoreError> {
        self.inner.patch_audience(namespace, name, audience).await?;
        self.metrics.audience_removals_total.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use prometheus_client::registry::Registry;
    use serde_json::{json, Value};

    use super::*;
    use crate::admission::fixtures::{pod, review};
    use crate::crd::{CMStateSpec, CMTemplateSpec};
    use crate::store::MockStateStore;

    fn app(store: MockStateStore) -> SharedState {
        let mut registry = Registry::default();
        Arc::new(AppState {
            store: Arc::new(store),
            metrics: InjectorMetrics::new(&mut registry),
        })
    }

    async fn call(state: &SharedState, body: Value) -> Value {
        handle_mutate(State(state.clone()), Json(body)).await.0
    }

    /// `response.patch` is serialized as the raw JSON bytes of the patch.
    fn decode_patch(response: &Value) -> Value {
        let bytes: Vec<u8> = serde_json::from_value(response["response"]["patch"].clone())
            .expect("patch present");
        serde_json::from_slice(&bytes).unwrap()
    }

    fn state_with(audience: &[&str]) -> CMState {
        CMState {
            metadata: ObjectMeta {
                name: Some("cmstate-foo-bar".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            spec: CMStateSpec {
                audience: audience.iter().map(|n| CMAudience::pod(*n)).collect(),
                cmtemplate: "Foo_Bar".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_create_pod_creates_state_and_injects_annotation() {
        let mut store = MockStateStore::new();
        store.expect_get_state().returning(|_, _| Ok(None));
        store
            .expect_get_template()
            .returning(|name| Ok(Some(CMTemplate::new(name, CMTemplateSpec::default()))));
        store
            .expect_create_state()
            .withf(|s| {
                s.metadata.name.as_deref() == Some("cmstate-foo-bar")
                    && s.metadata.namespace.as_deref() == Some("ns")
                    && s.spec.audience == vec![CMAudience::pod("app-1")]
            })
            .times(1)
            .returning(|s| Ok(s.clone()));

        let state = app(store);
        let out = call(&state, review("CREATE", pod("app-1", Some("Foo_Bar")))).await;

        assert_eq!(out["response"]["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(out["response"]["allowed"], true);
        assert_eq!(out["response"]["patchType"], "JSONPatch");
        assert_eq!(
            decode_patch(&out),
            json!([{
                "op": "add",
                "path": "/metadata/annotations/vault.hashicorp.com~1agent-configmap",
                "value": "cmstate-foo-bar"
            }])
        );
        assert_eq!(state.metrics.states_created_total.get(), 1);
    }

    #[tokio::test]
    async fn test_delete_pod_empties_audience_without_patch() {
        let mut store = MockStateStore::new();
        store
            .expect_get_state()
            .returning(|_, _| Ok(Some(state_with(&["app-1"]))));
        store
            .expect_get_template()
            .returning(|name| Ok(Some(CMTemplate::new(name, CMTemplateSpec::default()))));
        store
            .expect_patch_audience()
            .withf(|_, name, audience| name == "cmstate-foo-bar" && audience.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let state = app(store);
        let out = call(&state, review("DELETE", pod("app-1", Some("Foo_Bar")))).await;

        assert_eq!(out["response"]["allowed"], true);
        assert!(out["response"].get("patch").is_none_or(Value::is_null));
        assert_eq!(state.metrics.audience_removals_total.get(), 1);
    }

    #[tokio::test]
    async fn test_missing_template_is_internal_error() {
        let mut store = MockStateStore::new();
        store.expect_get_state().returning(|_, _| Ok(None));
        store.expect_get_template().returning(|_| Ok(None));
        store.expect_create_state().never();

        let state = app(store);
        let out = call(&state, review("CREATE", pod("app-1", Some("Foo_Bar")))).await;

        assert_eq!(out["response"]["allowed"], false);
        assert_eq!(out["response"]["status"]["code"], 500);
        assert_eq!(state.metrics.states_created_total.get(), 0);
    }

    #[tokio::test]
    async fn test_state_lookup_timeout_is_internal_error() {
        let mut store = MockStateStore::new();
        store.expect_get_state().returning(|_, _| {
            Err(StoreError::Timeout {
                operation: "get cmstate",
                after: std::time::Duration::from_millis(10),
            })
        });
        store.expect_get_template().never();
        store.expect_create_state().never();

        let state = app(store);
        let out = call(&state, review("CREATE", pod("app-1", Some("Foo_Bar")))).await;

        assert_eq!(out["response"]["allowed"], false);
        assert_eq!(out["response"]["status"]["code"], 500);
        let message = out["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("cmstate-foo-bar"), "{message}");
    }

    #[tokio::test]
    async fn test_patch_failure_is_denied_with_reason() {
        let mut store = MockStateStore::new();
        store
            .expect_get_state()
            .returning(|_, _| Ok(Some(state_with(&["app-1", "app-2"]))));
        store
            .expect_get_template()
            .returning(|name| Ok(Some(CMTemplate::new(name, CMTemplateSpec::default()))));
        store.expect_patch_audience().returning(|_, _, _| {
            Err(StoreError::Kube {
                operation: "patch cmstate audience",
                source: kube::Error::SerdeError(
                    serde_json::from_str::<Value>("{").unwrap_err(),
                ),
            })
        });

        let state = app(store);
        let out = call(&state, review("DELETE", pod("app-2", Some("Foo_Bar")))).await;

        assert_eq!(out["response"]["allowed"], false);
        assert_ne!(out["response"]["status"]["code"], 500);
        let message = out["response"]["status"]["message"].as_str().unwrap();
        assert!(message.contains("patching cmstate"), "{message}");
        assert_eq!(state.metrics.audience_removals_total.get(), 0);
    }

    #[tokio::test]
    async fn test_unannotated_pod_is_allowed_without_store_access() {
        let mut store = MockStateStore::new();
        store.expect_get_state().never();
        store.expect_get_template().never();

        let state = app(store);
        let out = call(&state, review("CREATE", pod("app-1", None))).await;

        assert_eq!(out["response"]["allowed"], true);
        assert!(out["response"].get("patch").is_none_or(Value::is_null));
    }

    #[tokio::test]
    async fn test_garbage_body_is_rejected() {
        let state = app(MockStateStore::new());
        let out = call(&state, json!({ "hello": "world" })).await;
        assert_eq!(out["response"]["allowed"], false);
    }
}
