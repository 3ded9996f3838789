use std::{sync::Arc, time::Duration};

use chrono::Utc;
use engine_integration::{
    EngineCommand, EngineEvent, EngineFactory, ExternalScript, DEFAULT_ENGINE_DOMAIN,
};
use shared::{
    domain::{CaptionEvent, ControlState, DisplayedCaption, LifecycleState, SessionIdentity},
    error::{ChannelError, EngineLoadError},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

mod caption_expiry;
pub mod caption_stream;
pub mod engine_adapter;
pub mod socket_io;

use caption_expiry::CaptionExpiry;
pub use caption_stream::{
    CaptionChannelParams, CaptionConnection, CaptionConnector, CaptionStream, ChannelMessage,
    MissingCaptionConnector,
};
pub use engine_adapter::ConferenceEngineAdapter;
pub use socket_io::{SocketIoConnector, DEFAULT_CAPTION_BACKEND_URL};

pub const DEFAULT_ENGINE_LOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CAPTION_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CAPTION_DISPLAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub engine_domain: String,
    pub engine_load_timeout: Duration,
    pub caption_connect_timeout: Duration,
    pub caption_display_duration: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine_domain: DEFAULT_ENGINE_DOMAIN.to_string(),
            engine_load_timeout: DEFAULT_ENGINE_LOAD_TIMEOUT,
            caption_connect_timeout: DEFAULT_CAPTION_CONNECT_TIMEOUT,
            caption_display_duration: DEFAULT_CAPTION_DISPLAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    Leave,
}

impl SessionCommand {
    fn engine_command(self) -> EngineCommand {
        match self {
            Self::ToggleAudio => EngineCommand::ToggleAudio,
            Self::ToggleVideo => EngineCommand::ToggleVideo,
            Self::ToggleScreenShare => EngineCommand::ToggleScreenShare,
            Self::Leave => EngineCommand::Hangup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Forwarded,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub lifecycle: LifecycleState,
    pub control: ControlState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LifecycleChanged(LifecycleState),
    ControlStateChanged(ControlState),
    /// The conference continues without captions.
    CaptionsUnavailable(ChannelError),
    /// The engine ended the conference; the session has been torn down.
    ConferenceLeft,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session cannot start from state {0}")]
    AlreadyStarted(LifecycleState),
    #[error(transparent)]
    EngineLoad(#[from] EngineLoadError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    /// Hangup already went out through `dispatch`.
    HungUp,
    ConferenceLeft,
}

struct SessionInner {
    lifecycle: LifecycleState,
    control: ControlState,
    caption_sequence: u64,
    expiry: CaptionExpiry,
    engine_task: Option<JoinHandle<()>>,
    caption_task: Option<JoinHandle<()>>,
}

/// Drives one participant's session: engine, caption channel and the
/// control state derived from both.
///
/// All state lives behind one mutex, so engine events, caption events, timer
/// expirations and caller commands are applied one at a time.
pub struct SessionCoordinator {
    config: SessionConfig,
    engine: ConferenceEngineAdapter,
    captions: CaptionStream,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        engine_factory: Arc<dyn EngineFactory>,
        caption_connector: Arc<dyn CaptionConnector>,
    ) -> Arc<Self> {
        Self::new_with_script(
            config,
            engine_factory,
            caption_connector,
            ExternalScript::process_wide(),
        )
    }

    pub fn new_with_script(
        config: SessionConfig,
        engine_factory: Arc<dyn EngineFactory>,
        caption_connector: Arc<dyn CaptionConnector>,
        script: Arc<ExternalScript>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            engine: ConferenceEngineAdapter::new(
                engine_factory,
                script,
                config.engine_domain.clone(),
                config.engine_load_timeout,
            ),
            captions: CaptionStream::new(caption_connector, config.caption_connect_timeout),
            config,
            inner: Mutex::new(SessionInner {
                lifecycle: LifecycleState::Idle,
                control: ControlState::default(),
                caption_sequence: 0,
                expiry: CaptionExpiry::default(),
                engine_task: None,
                caption_task: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            lifecycle: inner.lifecycle,
            control: inner.control.clone(),
        }
    }

    pub async fn lifecycle(&self) -> LifecycleState {
        self.inner.lock().await.lifecycle
    }

    pub async fn control_state(&self) -> ControlState {
        self.inner.lock().await.control.clone()
    }

    /// Brings up the engine, with the caption channel connecting alongside.
    ///
    /// Returns once the engine has loaded or failed. The session becomes
    /// Active later, when the engine reports that the conference was joined.
    /// The caption channel settles on its own task; a failure is reported as
    /// `SessionEvent::CaptionsUnavailable` and never delays or fails the engine.
    pub async fn start(self: &Arc<Self>, identity: SessionIdentity) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.lifecycle != LifecycleState::Idle {
                return Err(SessionError::AlreadyStarted(inner.lifecycle));
            }
            self.transition(&mut inner, LifecycleState::Initializing);
        }

        info!(
            meeting_id = %identity.meeting_id,
            participant_id = %identity.participant_id,
            "session: starting"
        );
        self.spawn_caption_connect(identity.clone());
        let engine_result = self.engine.load(&identity).await;

        let mut inner = self.inner.lock().await;
        if inner.lifecycle != LifecycleState::Initializing {
            debug!(state = %inner.lifecycle, "session: engine settled after teardown; ignoring");
            return Ok(());
        }

        match engine_result {
            Ok(events) => {
                inner.engine_task = Some(self.spawn_engine_pump(events));
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "session: engine failed to load");
                self.transition(&mut inner, LifecycleState::Failed);
                let tasks = (inner.engine_task.take(), inner.caption_task.take());
                drop(inner);
                self.release_resources(tasks).await;
                Err(err.into())
            }
        }
    }

    // Untracked: a connection finishing after teardown is closed by the stream itself.
    fn spawn_caption_connect(self: &Arc<Self>, identity: SessionIdentity) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.captions.connect(&identity).await;

            let mut inner = coordinator.inner.lock().await;
            if !inner.lifecycle.accepts_updates() {
                debug!(state = %inner.lifecycle, "session: caption channel settled after teardown");
                return;
            }
            match result {
                Ok(messages) => inner.caption_task = Some(coordinator.spawn_caption_pump(messages)),
                Err(err) => {
                    warn!(error = %err, "session: captions unavailable");
                    let _ = coordinator
                        .events
                        .send(SessionEvent::CaptionsUnavailable(err));
                }
            }
        });
    }

    /// Forwards a command to the engine while the session is Active; drops it otherwise.
    /// A forwarded `Leave` also tears the session down.
    pub async fn dispatch(&self, command: SessionCommand) -> DispatchOutcome {
        let lifecycle = self.lifecycle().await;
        if lifecycle != LifecycleState::Active {
            debug!(?command, state = %lifecycle, "session: not active; command dropped");
            return DispatchOutcome::Dropped;
        }

        match self.engine.execute(command.engine_command()).await {
            Ok(true) => {}
            Ok(false) => return DispatchOutcome::Dropped,
            Err(err) => warn!(?command, error = %err, "session: engine rejected command"),
        }
        if command == SessionCommand::Leave {
            self.stop_with(StopReason::HungUp).await;
        }
        DispatchOutcome::Forwarded
    }

    pub async fn set_captions_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        self.apply_captions_enabled(&mut inner, enabled);
    }

    /// Flips the caption overlay and returns the new setting.
    pub async fn toggle_captions(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let enabled = !inner.control.captions_enabled;
        self.apply_captions_enabled(&mut inner, enabled);
        enabled
    }

    fn apply_captions_enabled(&self, inner: &mut SessionInner, enabled: bool) {
        if inner.control.captions_enabled == enabled {
            return;
        }
        inner.control.captions_enabled = enabled;
        if !enabled {
            inner.expiry.cancel();
            inner.control.current_caption = None;
        }
        info!(enabled, "session: captions toggled");
        self.publish_control(inner);
    }

    /// Shows a caption, replacing the current one and restarting its expiry.
    pub async fn on_caption_event(self: &Arc<Self>, event: CaptionEvent) {
        let mut inner = self.inner.lock().await;
        if !inner.lifecycle.accepts_updates() {
            debug!(state = %inner.lifecycle, "session: stale caption dropped");
            return;
        }
        if !inner.control.captions_enabled {
            debug!("session: captions disabled; caption dropped");
            return;
        }

        inner.caption_sequence += 1;
        let sequence = inner.caption_sequence;
        let display = self.config.caption_display_duration;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(display).unwrap_or_else(|_| chrono::Duration::zero());
        inner.control.current_caption = Some(DisplayedCaption {
            text: event.text,
            sequence,
            expires_at,
        });

        let coordinator = Arc::clone(self);
        inner.expiry.schedule(sequence, display, async move {
            coordinator.expire_caption(sequence).await;
        });
        self.publish_control(&inner);
    }

    async fn expire_caption(&self, sequence: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.expiry.claim(sequence) {
            return;
        }
        let is_current = inner
            .control
            .current_caption
            .as_ref()
            .is_some_and(|caption| caption.sequence == sequence);
        if is_current {
            inner.control.current_caption = None;
            debug!(sequence, "session: caption expired");
            self.publish_control(&inner);
        }
    }

    /// Tears the session down. Safe to call repeatedly and from any state.
    pub async fn stop(&self) {
        self.stop_with(StopReason::Requested).await;
    }

    async fn stop_with(&self, reason: StopReason) {
        let (was_active, tasks) = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.lifecycle,
                LifecycleState::Leaving | LifecycleState::Terminated
            ) {
                debug!(state = %inner.lifecycle, "session: stop already handled");
                return;
            }

            let was_active = inner.lifecycle == LifecycleState::Active;
            self.transition(&mut inner, LifecycleState::Leaving);
            inner.expiry.cancel();
            if inner.control.current_caption.take().is_some() {
                self.publish_control(&inner);
            }
            (
                was_active,
                (inner.engine_task.take(), inner.caption_task.take()),
            )
        };

        if was_active && reason == StopReason::Requested {
            if let Err(err) = self.engine.execute(EngineCommand::Hangup).await {
                warn!(error = %err, "session: hangup failed");
            }
        }

        self.release_resources(tasks).await;

        {
            let mut inner = self.inner.lock().await;
            self.transition(&mut inner, LifecycleState::Terminated);
        }
        if reason == StopReason::ConferenceLeft {
            let _ = self.events.send(SessionEvent::ConferenceLeft);
        }
        info!(?reason, "session: terminated");
    }

    async fn release_resources(&self, tasks: (Option<JoinHandle<()>>, Option<JoinHandle<()>>)) {
        let (engine_task, caption_task) = tasks;
        for task in [engine_task, caption_task].into_iter().flatten() {
            task.abort();
        }
        if !self.engine.dispose().await {
            debug!("session: no engine instance to dispose");
        }
        if !self.captions.disconnect().await {
            debug!("session: no caption channel to disconnect");
        }
    }

    fn spawn_engine_pump(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<EngineEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => coordinator.handle_engine_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: engine events lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_engine_event(self: &Arc<Self>, event: EngineEvent) {
        let mut inner = self.inner.lock().await;
        if !inner.lifecycle.accepts_updates() {
            debug!(
                event = event.external_name(),
                state = %inner.lifecycle,
                "session: stale engine event dropped"
            );
            return;
        }

        match event {
            EngineEvent::Joined => {
                if inner.lifecycle == LifecycleState::Initializing {
                    info!("session: conference joined");
                    self.transition(&mut inner, LifecycleState::Active);
                } else {
                    debug!("session: duplicate joined event ignored");
                }
            }
            EngineEvent::Left => {
                info!("session: engine left the conference");
                drop(inner);
                // Teardown aborts this pump, so it must not run on it.
                let coordinator = Arc::clone(self);
                tokio::spawn(async move {
                    coordinator.stop_with(StopReason::ConferenceLeft).await;
                });
            }
            EngineEvent::AudioMuteChanged { muted } => {
                inner.control.audio_muted = muted;
                self.publish_control(&inner);
            }
            EngineEvent::VideoMuteChanged { muted } => {
                inner.control.video_enabled = !muted;
                self.publish_control(&inner);
            }
            EngineEvent::ScreenShareChanged { on } => {
                inner.control.screen_sharing = on;
                self.publish_control(&inner);
            }
        }
    }

    fn spawn_caption_pump(
        self: &Arc<Self>,
        mut messages: broadcast::Receiver<ChannelMessage>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(ChannelMessage::Caption(event)) => coordinator.on_caption_event(event).await,
                    Ok(ChannelMessage::Disconnected(reason)) => {
                        warn!(reason = %reason, "session: caption channel lost");
                        let _ = coordinator.events.send(SessionEvent::CaptionsUnavailable(
                            ChannelError::Disconnected(reason),
                        ));
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: caption events lagged")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn transition(&self, inner: &mut SessionInner, next: LifecycleState) {
        if inner.lifecycle == next {
            return;
        }
        debug!(from = %inner.lifecycle, to = %next, "session: lifecycle transition");
        inner.lifecycle = next;
        let _ = self.events.send(SessionEvent::LifecycleChanged(next));
    }

    fn publish_control(&self, inner: &SessionInner) {
        let _ = self
            .events
            .send(SessionEvent::ControlStateChanged(inner.control.clone()));
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
