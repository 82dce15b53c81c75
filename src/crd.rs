//! `cache.spices.dev/v1alpha1` resources read and written by the webhook.
//!
//! Only the fields the webhook touches are modelled; anything else on a
//! `CMTemplate` is ignored on read.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation a Pod carries to select the template it consumes.
pub const TEMPLATE_ANNOTATION: &str = "cache.spices.dev/cmtemplate";

/// Annotation the webhook writes onto the Pod, naming its `CMState`.
pub const STATE_ANNOTATION: &str = "vault.hashicorp.com/agent-configmap";

/// Kind recorded on every audience entry.
pub const POD_AUDIENCE_KIND: &str = "Pod";

/// Cluster-scoped template a Pod opts into through [`TEMPLATE_ANNOTATION`].
#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cache.spices.dev",
    version = "v1alpha1",
    kind = "CMTemplate",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CMTemplateSpec {
    #[serde(default)]
    pub template: CMTemplateData,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CMTemplateData {
    /// Keys that, when present as Pod annotations, become labels on the
    /// generated `CMState`. Values are used by the config renderer, not here.
    #[serde(default)]
    pub annotation_replace: BTreeMap<String, String>,
}

/// Per-namespace state shared by every Pod consuming one template.
#[derive(CustomResource, Serialize, Deserialize, Default, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cache.spices.dev",
    version = "v1alpha1",
    kind = "CMState",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
pub struct CMStateSpec {
    #[serde(default)]
    pub audience: Vec<CMAudience>,
    /// Name of the originating `CMTemplate`. Set at creation, never changed.
    pub cmtemplate: String,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct CMAudience {
    pub kind: String,
    pub name: String,
}

impl CMAudience {
    pub fn pod(name: impl Into<String>) -> Self {
        Self {
            kind: POD_AUDIENCE_KIND.to_string(),
            name: name.into(),
        }
    }
}
