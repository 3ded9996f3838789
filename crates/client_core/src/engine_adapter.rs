use std::{sync::Arc, time::Duration};

use anyhow::Result;
use engine_integration::{
    ConferenceEngine, EngineCommand, EngineEvent, EngineFactory, EngineOptions, ExternalScript,
};
use shared::{domain::SessionIdentity, error::EngineLoadError};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

#[derive(Default)]
struct EngineSlot {
    engine: Option<Arc<dyn ConferenceEngine>>,
    disposed: bool,
}

/// Owns the single engine instance of a session.
///
/// The adapter is single-use: once disposed it never publishes another
/// instance, and an instance that finishes loading afterwards is released on
/// the spot.
pub struct ConferenceEngineAdapter {
    factory: Arc<dyn EngineFactory>,
    script: Arc<ExternalScript>,
    domain: String,
    load_timeout: Duration,
    slot: Mutex<EngineSlot>,
}

impl ConferenceEngineAdapter {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        script: Arc<ExternalScript>,
        domain: impl Into<String>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            script,
            domain: domain.into(),
            load_timeout,
            slot: Mutex::new(EngineSlot::default()),
        }
    }

    pub async fn load(
        &self,
        identity: &SessionIdentity,
    ) -> Result<broadcast::Receiver<EngineEvent>, EngineLoadError> {
        let options = EngineOptions::for_session(identity);
        let loading = async {
            if let Err(err) = self.script.ensure_loaded(self.factory.as_ref()).await {
                return Err(err
                    .downcast::<EngineLoadError>()
                    .unwrap_or_else(|err| EngineLoadError::ScriptFetch(format!("{err:#}"))));
            }
            self.factory
                .instantiate(&self.domain, options)
                .await
                .map_err(|err| EngineLoadError::Instantiate(format!("{err:#}")))
        };

        let engine = tokio::time::timeout(self.load_timeout, loading)
            .await
            .map_err(|_| EngineLoadError::Timeout(self.load_timeout))??;

        let mut slot = self.slot.lock().await;
        if slot.disposed {
            drop(slot);
            warn!("engine: instance finished loading after dispose; releasing it");
            if let Err(err) = engine.dispose().await {
                warn!(error = %err, "engine: failed to dispose late instance");
            }
            return Err(EngineLoadError::Disposed);
        }

        let events = engine.subscribe_events();
        slot.engine = Some(engine);
        info!(domain = %self.domain, room = %identity.meeting_id, "engine: instance ready");
        Ok(events)
    }

    /// Forwards a command to the live instance. `Ok(false)` means there was none.
    pub async fn execute(&self, command: EngineCommand) -> Result<bool> {
        // Held across the call so commands reach the engine in dispatch order.
        let slot = self.slot.lock().await;
        let Some(engine) = slot.engine.as_ref() else {
            debug!(
                command = command.external_name(),
                "engine: no instance; command dropped"
            );
            return Ok(false);
        };
        engine.execute(command).await?;
        debug!(command = command.external_name(), "engine: command sent");
        Ok(true)
    }

    /// Releases the instance, if any. Returns whether one was released.
    pub async fn dispose(&self) -> bool {
        let engine = {
            let mut slot = self.slot.lock().await;
            slot.disposed = true;
            slot.engine.take()
        };

        let Some(engine) = engine else {
            return false;
        };
        if let Err(err) = engine.dispose().await {
            warn!(error = %err, "engine: dispose failed");
        }
        info!("engine: instance disposed");
        true
    }
}

#[cfg(test)]
#[path = "tests/engine_adapter_tests.rs"]
mod tests;
