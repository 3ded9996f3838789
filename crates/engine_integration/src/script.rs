use reqwest::Client;
use shared::error::EngineLoadError;
use tracing::debug;

pub const DEFAULT_SCRIPT_URL: &str = "https://meet.jit.si/external_api.js";
pub const DEFAULT_CONSTRUCTOR: &str = "JitsiMeetExternalAPI";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalApiScript {
    pub url: String,
    pub constructor: String,
}

impl Default for ExternalApiScript {
    fn default() -> Self {
        Self {
            url: DEFAULT_SCRIPT_URL.to_string(),
            constructor: DEFAULT_CONSTRUCTOR.to_string(),
        }
    }
}

impl ExternalApiScript {
    pub fn new(url: impl Into<String>, constructor: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            constructor: constructor.into(),
        }
    }

    /// Downloads the script and checks that it defines the engine constructor.
    pub async fn fetch(&self, http: &Client) -> Result<String, EngineLoadError> {
        let body = http
            .get(&self.url)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|err| EngineLoadError::ScriptFetch(err.to_string()))?
            .text()
            .await
            .map_err(|err| EngineLoadError::ScriptFetch(err.to_string()))?;

        if !body.contains(&self.constructor) {
            return Err(EngineLoadError::MissingConstructor {
                constructor: self.constructor.clone(),
            });
        }

        debug!(url = %self.url, bytes = body.len(), "engine: script fetched");
        Ok(body)
    }
}
