use thiserror::Error;

use crate::store::StoreError;

/// Failures that stop the webhook from reaching a decision. Every variant is
/// reported to the API server as an internal error, never as a denial.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("admission request carries no object to decode")]
    MissingObject,
    #[error("error decoding request into Pod: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("fetching cmstate '{name}' has resulted in an error: {source}")]
    StateLookup { name: String, source: StoreError },
    #[error("fetching cmtemplate '{name}' has resulted in an error: {source}")]
    TemplateLookup { name: String, source: StoreError },
    #[error("cmtemplate '{0}' not found")]
    TemplateNotFound(String),
    #[error("writing cmstate '{name}' did not complete: {source}")]
    StateWriteTimeout { name: String, source: StoreError },
}
