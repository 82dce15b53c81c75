use crate::crd::{CMState, CMTemplate};
use crate::error::WebhookError;
use crate::store::StateStore;

const STATE_NAME_PREFIX: &str = "cmstate-";

/// Name of the `CMState` generated for a template.
pub fn state_name(template: &str) -> String {
    format!("{STATE_NAME_PREFIX}{template}")
        .to_lowercase()
        .replace('_', "-")
}

/// Everything the mutator needs to decide on one Pod.
#[derive(Debug)]
pub struct Resolved {
    pub state_name: String,
    /// `None` until the first Pod using the template in this namespace is admitted.
    pub state: Option<CMState>,
    pub template: CMTemplate,
}

/// Looks up the state for `template` in `namespace` and the template itself.
/// Read-only.
pub async fn resolve<S>(store: &S, namespace: &str, template: &str) -> Result<Resolved, WebhookError>
where
    S: StateStore + ?Sized,
{
    let name = state_name(template);

    let state = store
        .get_state(namespace, &name)
        .await
        .map_err(|source| WebhookError::StateLookup {
            name: name.clone(),
            source,
        })?;

    let template = store
        .get_template(template)
        .await
        .map_err(|source| WebhookError::TemplateLookup {
            name: template.to_string(),
            source,
        })?
        .ok_or_else(|| WebhookError::TemplateNotFound(template.to_string()))?;

    Ok(Resolved {
        state_name: name,
        state,
        template,
    })
}
