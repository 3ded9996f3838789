use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use engine_integration::{
    ConferenceEngine, EngineCommand, EngineEvent, EngineFactory, EngineOptions,
};
use shared::{
    domain::{CaptionEvent, MeetingId, SessionIdentity},
    error::{ChannelError, EngineLoadError},
};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::caption_stream::{
    CaptionChannelParams, CaptionConnection, CaptionConnector, ChannelMessage,
};

pub(crate) fn identity() -> SessionIdentity {
    SessionIdentity::new(
        Some(MeetingId::from("standup42")),
        "participant-7",
        "Grace",
        Some("grace@example.com".to_string()),
    )
}

/// Lets spawned pumps run without advancing a paused clock.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub(crate) struct FakeEngine {
    events: broadcast::Sender<EngineEvent>,
    commands: Mutex<Vec<EngineCommand>>,
    disposals: AtomicU32,
}

impl FakeEngine {
    fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            events,
            commands: Mutex::new(Vec::new()),
            disposals: AtomicU32::new(0),
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn commands(&self) -> Vec<EngineCommand> {
        self.commands.lock().await.clone()
    }

    pub(crate) fn disposals(&self) -> u32 {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConferenceEngine for FakeEngine {
    async fn execute(&self, command: EngineCommand) -> Result<()> {
        self.commands.lock().await.push(command);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

pub(crate) enum ScriptBehavior {
    Ready,
    Fail(EngineLoadError),
    Hang,
}

pub(crate) struct FakeEngineFactory {
    pub(crate) engine: Arc<FakeEngine>,
    script: ScriptBehavior,
    instantiate_error: Option<String>,
    gate: Option<Arc<Notify>>,
    script_loads: AtomicU32,
    instantiated: Mutex<Vec<(String, EngineOptions)>>,
}

impl FakeEngineFactory {
    pub(crate) fn new() -> Self {
        Self {
            engine: Arc::new(FakeEngine::new()),
            script: ScriptBehavior::Ready,
            instantiate_error: None,
            gate: None,
            script_loads: AtomicU32::new(0),
            instantiated: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_script(mut self, script: ScriptBehavior) -> Self {
        self.script = script;
        self
    }

    pub(crate) fn failing_instantiate(mut self, message: impl Into<String>) -> Self {
        self.instantiate_error = Some(message.into());
        self
    }

    /// Holds `instantiate` until the gate is notified.
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn script_loads(&self) -> u32 {
        self.script_loads.load(Ordering::SeqCst)
    }

    pub(crate) async fn instantiated(&self) -> Vec<(String, EngineOptions)> {
        self.instantiated.lock().await.clone()
    }
}

#[async_trait]
impl EngineFactory for FakeEngineFactory {
    async fn load_script(&self) -> Result<()> {
        self.script_loads.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            ScriptBehavior::Ready => Ok(()),
            ScriptBehavior::Fail(err) => Err(err.clone().into()),
            ScriptBehavior::Hang => std::future::pending().await,
        }
    }

    async fn instantiate(
        &self,
        domain: &str,
        options: EngineOptions,
    ) -> Result<Arc<dyn ConferenceEngine>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(message) = &self.instantiate_error {
            return Err(anyhow!(message.clone()));
        }
        self.instantiated
            .lock()
            .await
            .push((domain.to_string(), options));
        Ok(self.engine.clone())
    }
}

pub(crate) struct FakeCaptionConnection {
    messages: broadcast::Sender<ChannelMessage>,
    closes: AtomicU32,
}

impl FakeCaptionConnection {
    fn new() -> Self {
        let (messages, _) = broadcast::channel(32);
        Self {
            messages,
            closes: AtomicU32::new(0),
        }
    }

    pub(crate) fn push_caption(&self, text: &str) {
        let _ = self
            .messages
            .send(ChannelMessage::Caption(CaptionEvent::received_now(text)));
    }

    pub(crate) fn drop_channel(&self, reason: &str) {
        let _ = self
            .messages
            .send(ChannelMessage::Disconnected(reason.to_string()));
    }

    pub(crate) fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptionConnection for FakeCaptionConnection {
    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeCaptionConnector {
    pub(crate) connection: Arc<FakeCaptionConnection>,
    failure: Option<ChannelError>,
    hang: bool,
    gate: Option<Arc<Notify>>,
    params: Mutex<Vec<CaptionChannelParams>>,
}

impl FakeCaptionConnector {
    pub(crate) fn new() -> Self {
        Self {
            connection: Arc::new(FakeCaptionConnection::new()),
            failure: None,
            hang: false,
            gate: None,
            params: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(mut self, err: ChannelError) -> Self {
        self.failure = Some(err);
        self
    }

    pub(crate) fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) async fn params(&self) -> Vec<CaptionChannelParams> {
        self.params.lock().await.clone()
    }
}

#[async_trait]
impl CaptionConnector for FakeCaptionConnector {
    async fn connect(&self, params: CaptionChannelParams) -> Result<Arc<dyn CaptionConnection>> {
        self.params.lock().await.push(params);
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone().into());
        }
        Ok(self.connection.clone())
    }
}
