use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const MEETING_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MEETING_ID_PART_LEN: usize = 11;
const FALLBACK_DISPLAY_NAME: &str = "User";

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id_newtype!(MeetingId);
string_id_newtype!(ParticipantId);

impl MeetingId {
    /// Generates an opaque room token from two independent base-36 runs.
    ///
    /// Collisions are not detected; meeting ids form a cooperative namespace.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut token = String::with_capacity(MEETING_ID_PART_LEN * 2);
        for _ in 0..2 {
            token.push_str(&base36_run(&mut rng, MEETING_ID_PART_LEN));
        }
        Self(token)
    }
}

fn base36_run(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..MEETING_ID_ALPHABET.len());
            char::from(MEETING_ID_ALPHABET[idx])
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub meeting_id: MeetingId,
    pub participant_id: ParticipantId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_address: Option<String>,
}

impl SessionIdentity {
    pub fn new(
        meeting_id: Option<MeetingId>,
        participant_id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        contact_address: Option<String>,
    ) -> Self {
        let display_name = display_name.into();
        let display_name = if display_name.trim().is_empty() {
            FALLBACK_DISPLAY_NAME.to_string()
        } else {
            display_name
        };

        Self {
            meeting_id: meeting_id.unwrap_or_else(MeetingId::generate),
            participant_id: participant_id.into(),
            display_name,
            contact_address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Initializing,
    Active,
    Leaving,
    Terminated,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Whether late engine or channel results may still mutate session state.
    pub fn accepts_updates(&self) -> bool {
        matches!(self, Self::Initializing | Self::Active)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionEvent {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl CaptionEvent {
    pub fn received_now(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayedCaption {
    pub text: String,
    pub sequence: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub audio_muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub captions_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_caption: Option<DisplayedCaption>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            audio_muted: false,
            video_enabled: true,
            screen_sharing: false,
            captions_enabled: false,
            current_caption: None,
        }
    }
}

impl ControlState {
    pub fn caption_text(&self) -> Option<&str> {
        self.current_caption
            .as_ref()
            .map(|caption| caption.text.as_str())
    }
}
