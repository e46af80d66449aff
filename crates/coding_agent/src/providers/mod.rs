use std::sync::Arc;

use agent_provider::{ProviderInitError, RunProvider};
use agent_provider_mock::{ScriptedProvider, MOCK_PROVIDER_ID};

pub const DEFAULT_PROVIDER_ID: &str = MOCK_PROVIDER_ID;
pub const PROVIDER_ENV_VAR: &str = "CODING_AGENT_PROVIDER";

/// Reply used when the scripted provider runs without a script.
const DEFAULT_SCRIPT: &str = r#"I have no script to follow, so I will finish right away.
<calls>
<call name="attempt_completion">
<param name="result">No scripted turns were provided. Pass --script with a turn file to replay a session.</param>
</call>
</calls>"#;

/// Resolves the provider named by `CODING_AGENT_PROVIDER` (default `mock`).
///
/// `script` is the text of a turn file for the scripted provider.
pub fn provider_from_env(script: Option<&str>) -> Result<Arc<dyn RunProvider>, ProviderInitError> {
    let provider_id = std::env::var(PROVIDER_ENV_VAR)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    provider_for_id(provider_id.as_deref().unwrap_or(DEFAULT_PROVIDER_ID), script)
}

pub fn provider_for_id(
    provider_id: &str,
    script: Option<&str>,
) -> Result<Arc<dyn RunProvider>, ProviderInitError> {
    match provider_id {
        DEFAULT_PROVIDER_ID => Ok(Arc::new(ScriptedProvider::from_script_text(
            script.unwrap_or(DEFAULT_SCRIPT),
        ))),
        unknown => Err(ProviderInitError::new(format!(
            "Unsupported provider '{unknown}'. Available providers: {DEFAULT_PROVIDER_ID}"
        ))),
    }
}
