//! Headless engine that answers commands with the state events a hosted
//! conference would emit. Used when no media engine is embedded.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::{
    ConferenceEngine, EngineCommand, EngineEvent, EngineFactory, EngineOptions, ExternalApiScript,
};

pub struct LoopbackEngineFactory {
    http: Client,
    script: Option<ExternalApiScript>,
}

impl LoopbackEngineFactory {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            script: None,
        }
    }

    /// Requires the external script to be reachable before any engine is created.
    pub fn verifying_script(script: ExternalApiScript) -> Self {
        Self {
            http: Client::new(),
            script: Some(script),
        }
    }
}

impl Default for LoopbackEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineFactory for LoopbackEngineFactory {
    async fn load_script(&self) -> Result<()> {
        if let Some(script) = &self.script {
            script.fetch(&self.http).await?;
        }
        Ok(())
    }

    async fn instantiate(
        &self,
        domain: &str,
        options: EngineOptions,
    ) -> Result<Arc<dyn ConferenceEngine>> {
        info!(
            domain,
            room = %options.room_name,
            display_name = %options.user_info.display_name,
            "engine: loopback instance created"
        );
        Ok(Arc::new(LoopbackEngine::new(&options)))
    }
}

#[derive(Debug, Default)]
struct LoopbackMedia {
    audio_muted: bool,
    video_muted: bool,
    screen_sharing: bool,
    left: bool,
}

pub struct LoopbackEngine {
    events: broadcast::Sender<EngineEvent>,
    media: Mutex<LoopbackMedia>,
    join_announced: AtomicBool,
    disposed: AtomicBool,
}

impl LoopbackEngine {
    fn new(options: &EngineOptions) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            media: Mutex::new(LoopbackMedia {
                audio_muted: options.config_overwrite.start_with_audio_muted,
                video_muted: options.config_overwrite.start_with_video_muted,
                ..LoopbackMedia::default()
            }),
            join_announced: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ConferenceEngine for LoopbackEngine {
    async fn execute(&self, command: EngineCommand) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(anyhow!("engine already disposed"));
        }

        let event = {
            let mut media = self.media.lock().await;
            if media.left {
                return Err(anyhow!("conference already left"));
            }
            match command {
                EngineCommand::ToggleAudio => {
                    media.audio_muted = !media.audio_muted;
                    EngineEvent::AudioMuteChanged {
                        muted: media.audio_muted,
                    }
                }
                EngineCommand::ToggleVideo => {
                    media.video_muted = !media.video_muted;
                    EngineEvent::VideoMuteChanged {
                        muted: media.video_muted,
                    }
                }
                EngineCommand::ToggleScreenShare => {
                    media.screen_sharing = !media.screen_sharing;
                    EngineEvent::ScreenShareChanged {
                        on: media.screen_sharing,
                    }
                }
                EngineCommand::Hangup => {
                    media.left = true;
                    EngineEvent::Left
                }
            }
        };

        debug!(
            command = command.external_name(),
            event = event.external_name(),
            "engine: loopback"
        );
        let _ = self.events.send(event);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        let rx = self.events.subscribe();
        // The conference is "joined" as soon as someone listens for it.
        if !self.join_announced.swap(true, Ordering::SeqCst) {
            let events = self.events.clone();
            tokio::spawn(async move {
                let _ = events.send(EngineEvent::Joined);
            });
        }
        rx
    }
}
