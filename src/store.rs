use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CMAudience, CMState, CMTemplate};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed: {source}")]
    Kube {
        operation: &'static str,
        source: kube::Error,
    },
    #[error("{operation} did not complete within {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StoreError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

/// Cluster object store as seen by the admission pipeline.
///
/// Lookups return `Ok(None)` when the object does not exist; every other
/// failure, including a deadline expiry, is an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, StoreError>;

    async fn get_template(&self, name: &str) -> Result<Option<CMTemplate>, StoreError>;

    async fn create_state(&self, state: &CMState) -> Result<CMState, StoreError>;

    /// Replace `spec.audience` with a JSON merge patch.
    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: &[CMAudience],
    ) -> Result<(), StoreError>;
}

/// [`StateStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|source| StoreError::Kube { operation, source }),
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl StateStore for KubeStore {
    async fn get_state(&self, namespace: &str, name: &str) -> Result<Option<CMState>, StoreError> {
        let api: Api<CMState> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("get cmstate", api.get_opt(name)).await
    }

    async fn get_template(&self, name: &str) -> Result<Option<CMTemplate>, StoreError> {
        let api: Api<CMTemplate> = Api::all(self.client.clone());
        self.bounded("get cmtemplate", api.get_opt(name)).await
    }

    async fn create_state(&self, state: &CMState) -> Result<CMState, StoreError> {
        let namespace = state.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<CMState> = Api::namespaced(self.client.clone(), namespace);
        self.bounded("create cmstate", api.create(&PostParams::default(), state))
            .await
    }

    async fn patch_audience(
        &self,
        namespace: &str,
        name: &str,
        audience: &[CMAudience],
    ) -> Result<(), StoreError> {
        let api: Api<CMState> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "audience": audience } });
        self.bounded(
            "patch cmstate audience",
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map(|_| ())
    }
}
