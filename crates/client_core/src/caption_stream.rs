use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CaptionEvent, SessionIdentity},
    error::ChannelError,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

/// Connection parameters the caption backend uses to route a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionChannelParams {
    pub meeting_id: String,
    pub user_id: String,
    pub user_name: String,
}

impl CaptionChannelParams {
    pub fn for_session(identity: &SessionIdentity) -> Self {
        Self {
            meeting_id: identity.meeting_id.0.clone(),
            user_id: identity.participant_id.0.clone(),
            user_name: identity.display_name.clone(),
        }
    }

    pub fn query_pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("meetingId", self.meeting_id.as_str()),
            ("userId", self.user_id.as_str()),
            ("userName", self.user_name.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Caption(CaptionEvent),
    Disconnected(String),
}

#[async_trait]
pub trait CaptionConnection: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait CaptionConnector: Send + Sync {
    async fn connect(&self, params: CaptionChannelParams) -> Result<Arc<dyn CaptionConnection>>;
}

pub struct MissingCaptionConnector;

#[async_trait]
impl CaptionConnector for MissingCaptionConnector {
    async fn connect(&self, _params: CaptionChannelParams) -> Result<Arc<dyn CaptionConnection>> {
        Err(anyhow!("caption backend is unavailable"))
    }
}

#[derive(Default)]
struct StreamSlot {
    connection: Option<Arc<dyn CaptionConnection>>,
    closed: bool,
}

/// Owns the caption channel of a session. Single-use, like the engine adapter.
pub struct CaptionStream {
    connector: Arc<dyn CaptionConnector>,
    connect_timeout: Duration,
    slot: Mutex<StreamSlot>,
}

impl CaptionStream {
    pub fn new(connector: Arc<dyn CaptionConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            slot: Mutex::new(StreamSlot::default()),
        }
    }

    pub async fn connect(
        &self,
        identity: &SessionIdentity,
    ) -> Result<broadcast::Receiver<ChannelMessage>, ChannelError> {
        let params = CaptionChannelParams::for_session(identity);
        let connection = tokio::time::timeout(self.connect_timeout, self.connector.connect(params))
            .await
            .map_err(|_| ChannelError::Timeout(self.connect_timeout))?
            .map_err(|err| {
                err.downcast::<ChannelError>()
                    .unwrap_or_else(|err| ChannelError::Connect(format!("{err:#}")))
            })?;

        let mut slot = self.slot.lock().await;
        if slot.closed {
            drop(slot);
            warn!("captions: channel connected after disconnect; closing it");
            if let Err(err) = connection.close().await {
                warn!(error = %err, "captions: failed to close late channel");
            }
            return Err(ChannelError::Closed);
        }

        let messages = connection.subscribe();
        slot.connection = Some(connection);
        info!(meeting_id = %identity.meeting_id, "captions: channel connected");
        Ok(messages)
    }

    /// Closes the channel, if any. Returns whether one was closed.
    pub async fn disconnect(&self) -> bool {
        let connection = {
            let mut slot = self.slot.lock().await;
            slot.closed = true;
            slot.connection.take()
        };

        let Some(connection) = connection else {
            return false;
        };
        if let Err(err) = connection.close().await {
            warn!(error = %err, "captions: close failed");
        }
        info!("captions: channel disconnected");
        true
    }
}

#[cfg(test)]
#[path = "tests/caption_stream_tests.rs"]
mod tests;
