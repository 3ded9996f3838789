use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::SessionIdentity;
use tokio::sync::{broadcast, OnceCell};
use tracing::info;

pub mod loopback;
pub mod script;

pub use loopback::LoopbackEngineFactory;
pub use script::ExternalApiScript;

pub const DEFAULT_ENGINE_DOMAIN: &str = "meet.jit.si";

/// Toolbar entries the engine is allowed to render, in display order.
pub const TOOLBAR_BUTTONS: [&str; 25] = [
    "microphone",
    "camera",
    "closedcaptions",
    "desktop",
    "fullscreen",
    "fodeviceselection",
    "hangup",
    "chat",
    "recording",
    "livestreaming",
    "etherpad",
    "sharedvideo",
    "settings",
    "raisehand",
    "videoquality",
    "filmstrip",
    "feedback",
    "stats",
    "shortcuts",
    "tileview",
    "select-background",
    "download",
    "help",
    "mute-everyone",
    "security",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineUserInfo {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfigOverwrite {
    pub start_with_audio_muted: bool,
    pub start_with_video_muted: bool,
    pub prejoin_page_enabled: bool,
    pub disable_moderator_indicator: bool,
    pub enable_close_page: bool,
    pub toolbar_buttons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EngineInterfaceOverwrite {
    pub toolbar_buttons: Vec<String>,
    pub show_jitsi_watermark: bool,
    pub show_watermark_for_guests: bool,
    pub show_powered_by: bool,
    pub show_brand_watermark: bool,
    pub show_promotional_splash: bool,
    pub authentication_enable: bool,
    pub toolbar_always_visible: bool,
    pub vertical_filmstrip: bool,
    pub filmstrip_max_height: u32,
    pub filmstrip_max_width: u32,
}

/// Constructor options handed to the external engine, keyed the way its API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    pub room_name: String,
    pub width: String,
    pub height: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node: Option<String>,
    pub user_info: EngineUserInfo,
    pub config_overwrite: EngineConfigOverwrite,
    pub interface_config_overwrite: EngineInterfaceOverwrite,
}

impl EngineOptions {
    pub fn for_session(identity: &SessionIdentity) -> Self {
        let toolbar: Vec<String> = TOOLBAR_BUTTONS.iter().map(|b| b.to_string()).collect();
        Self {
            room_name: identity.meeting_id.0.clone(),
            width: "100%".to_string(),
            height: "100%".to_string(),
            parent_node: None,
            user_info: EngineUserInfo {
                display_name: identity.display_name.clone(),
                email: identity.contact_address.clone(),
            },
            config_overwrite: EngineConfigOverwrite {
                start_with_audio_muted: false,
                start_with_video_muted: false,
                prejoin_page_enabled: false,
                disable_moderator_indicator: true,
                enable_close_page: false,
                toolbar_buttons: toolbar.clone(),
            },
            interface_config_overwrite: EngineInterfaceOverwrite {
                toolbar_buttons: toolbar,
                show_jitsi_watermark: false,
                show_watermark_for_guests: false,
                show_powered_by: false,
                show_brand_watermark: false,
                show_promotional_splash: false,
                authentication_enable: false,
                toolbar_always_visible: true,
                vertical_filmstrip: true,
                filmstrip_max_height: 120,
                filmstrip_max_width: 200,
            },
        }
    }

    pub fn with_parent_node(mut self, parent_node: impl Into<String>) -> Self {
        self.parent_node = Some(parent_node.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Joined,
    Left,
    AudioMuteChanged { muted: bool },
    VideoMuteChanged { muted: bool },
    ScreenShareChanged { on: bool },
}

impl EngineEvent {
    pub fn external_name(&self) -> &'static str {
        match self {
            Self::Joined => "videoConferenceJoined",
            Self::Left => "videoConferenceLeft",
            Self::AudioMuteChanged { .. } => "audioMuteStatusChanged",
            Self::VideoMuteChanged { .. } => "videoMuteStatusChanged",
            Self::ScreenShareChanged { .. } => "screenSharingStatusChanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    Hangup,
}

impl EngineCommand {
    pub fn external_name(&self) -> &'static str {
        match self {
            Self::ToggleAudio => "toggleAudio",
            Self::ToggleVideo => "toggleVideo",
            Self::ToggleScreenShare => "toggleShareScreen",
            Self::Hangup => "hangup",
        }
    }
}

/// A live engine instance. Commands are requests; their effects arrive as events.
#[async_trait]
pub trait ConferenceEngine: Send + Sync {
    async fn execute(&self, command: EngineCommand) -> anyhow::Result<()>;
    async fn dispose(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

#[async_trait]
pub trait EngineFactory: Send + Sync {
    /// Fetches the engine's script resource so its constructor becomes available.
    async fn load_script(&self) -> anyhow::Result<()>;
    async fn instantiate(
        &self,
        domain: &str,
        options: EngineOptions,
    ) -> anyhow::Result<Arc<dyn ConferenceEngine>>;
}

pub struct MissingEngineFactory;

#[async_trait]
impl EngineFactory for MissingEngineFactory {
    async fn load_script(&self) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("conference engine is unavailable"))
    }

    async fn instantiate(
        &self,
        _domain: &str,
        _options: EngineOptions,
    ) -> anyhow::Result<Arc<dyn ConferenceEngine>> {
        Err(anyhow::anyhow!("conference engine is unavailable"))
    }
}

static PROCESS_SCRIPT: OnceLock<Arc<ExternalScript>> = OnceLock::new();

/// Tracks whether the engine script has been loaded.
///
/// Initialised at most once and never torn down. Concurrent callers share a
/// single in-flight load; a failed load leaves the state empty so a later
/// session may try again.
#[derive(Default)]
pub struct ExternalScript {
    loaded: OnceCell<()>,
}

impl ExternalScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The state shared by every session in this process.
    pub fn process_wide() -> Arc<Self> {
        Arc::clone(PROCESS_SCRIPT.get_or_init(ExternalScript::new))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    pub async fn ensure_loaded(&self, factory: &dyn EngineFactory) -> anyhow::Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                factory.load_script().await?;
                info!("engine: external script loaded");
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}
