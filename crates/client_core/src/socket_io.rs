//! Caption channel over a Socket.IO websocket transport.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::CaptionEvent,
    error::ChannelError,
    protocol::{CaptionChannelEvent, EnginePacket, SocketPacket, ENGINE_IO_VERSION},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::caption_stream::{
    CaptionChannelParams, CaptionConnection, CaptionConnector, ChannelMessage,
};

pub const DEFAULT_CAPTION_BACKEND_URL: &str = "http://localhost:5000";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = Arc<Mutex<SplitSink<Socket, Message>>>;
type SocketReader = SplitStream<Socket>;

/// Builds the websocket endpoint for a backend base address.
pub fn channel_url(
    backend_url: &str,
    params: &CaptionChannelParams,
) -> Result<Url, ChannelError> {
    let mut url = Url::parse(backend_url).map_err(|err| {
        ChannelError::Connect(format!("invalid backend url {backend_url}: {err}"))
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::Connect(format!(
                "backend url must use http(s) or ws(s), got {other}"
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        ChannelError::Connect(format!("cannot use scheme {scheme} for {backend_url}"))
    })?;
    url.set_path("/socket.io/");
    url.set_fragment(None);
    {
        let mut query = url.query_pairs_mut();
        query
            .clear()
            .append_pair("EIO", ENGINE_IO_VERSION)
            .append_pair("transport", "websocket");
        for (key, value) in params.query_pairs() {
            query.append_pair(key, value);
        }
    }
    Ok(url)
}

pub struct SocketIoConnector {
    backend_url: String,
}

impl SocketIoConnector {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
        }
    }
}

impl Default for SocketIoConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTION_BACKEND_URL)
    }
}

#[async_trait]
impl CaptionConnector for SocketIoConnector {
    async fn connect(&self, params: CaptionChannelParams) -> Result<Arc<dyn CaptionConnection>> {
        let url = channel_url(&self.backend_url, &params)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(format!("{url}: {err}")))?;
        let (writer, mut reader) = socket.split();
        let writer: SocketWriter = Arc::new(Mutex::new(writer));

        handshake(&mut reader, &writer).await?;
        info!(
            meeting_id = %params.meeting_id,
            user_id = %params.user_id,
            "captions: socket.io session established"
        );

        let (events, initial) = broadcast::channel(64);
        let pump = tokio::spawn(pump_frames(reader, Arc::clone(&writer), events.clone()));
        Ok(Arc::new(SocketIoConnection {
            events,
            initial: std::sync::Mutex::new(Some(initial)),
            writer,
            pump,
            closed: AtomicBool::new(false),
        }))
    }
}

async fn send_packet(writer: &SocketWriter, packet: EnginePacket) -> Result<(), ChannelError> {
    writer
        .lock()
        .await
        .send(Message::Text(packet.encode()))
        .await
        .map_err(|err| ChannelError::Disconnected(err.to_string()))
}

async fn next_packet(reader: &mut SocketReader) -> Result<EnginePacket, ChannelError> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Text(frame))) => {
                return EnginePacket::decode(&frame)
                    .map_err(|err| ChannelError::Connect(format!("bad handshake frame: {err}")))
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::Disconnected(
                    "socket closed during handshake".to_string(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(ChannelError::Disconnected(err.to_string())),
        }
    }
}

async fn handshake(reader: &mut SocketReader, writer: &SocketWriter) -> Result<(), ChannelError> {
    match next_packet(reader).await? {
        EnginePacket::Open(open) => {
            debug!(sid = %open.sid, ping_interval = open.ping_interval, "captions: engine.io open")
        }
        other => {
            return Err(ChannelError::Connect(format!(
                "expected engine.io open packet, got {other:?}"
            )))
        }
    }

    send_packet(writer, EnginePacket::Message(SocketPacket::connect_default())).await?;

    loop {
        match next_packet(reader).await? {
            EnginePacket::Message(SocketPacket::Connect { namespace, .. }) if namespace == "/" => {
                return Ok(())
            }
            EnginePacket::Message(SocketPacket::ConnectError { payload, .. }) => {
                return Err(ChannelError::Rejected(payload.to_string()))
            }
            EnginePacket::Ping(data) => send_packet(writer, EnginePacket::Pong(data)).await?,
            EnginePacket::Close => {
                return Err(ChannelError::Disconnected(
                    "server closed during handshake".to_string(),
                ))
            }
            other => debug!(packet = ?other, "captions: ignoring packet during handshake"),
        }
    }
}

async fn pump_frames(
    mut reader: SocketReader,
    writer: SocketWriter,
    events: broadcast::Sender<ChannelMessage>,
) {
    let reason = loop {
        let frame = match reader.next().await {
            Some(Ok(Message::Text(frame))) => frame,
            Some(Ok(Message::Close(_))) => break "server closed the socket".to_string(),
            Some(Ok(_)) => continue,
            Some(Err(err)) => break format!("websocket receive failed: {err}"),
            None => break "socket stream ended".to_string(),
        };

        let packet = match EnginePacket::decode(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "captions: invalid frame");
                continue;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                if let Err(err) = send_packet(&writer, EnginePacket::Pong(data)).await {
                    break format!("failed to answer ping: {err}");
                }
            }
            EnginePacket::Message(SocketPacket::Event { name, args, .. }) => {
                match CaptionChannelEvent::from_socket_event(&name, &args) {
                    Ok(Some(CaptionChannelEvent::TranslationResult(result))) => {
                        let _ = events.send(ChannelMessage::Caption(CaptionEvent::received_now(
                            result.text,
                        )));
                    }
                    Ok(None) => debug!(event = %name, "captions: ignoring event"),
                    Err(err) => warn!(event = %name, error = %err, "captions: invalid event payload"),
                }
            }
            EnginePacket::Message(SocketPacket::Disconnect { .. }) => {
                break "server disconnected the namespace".to_string()
            }
            EnginePacket::Close => break "server closed the session".to_string(),
            other => debug!(packet = ?other, "captions: ignoring packet"),
        }
    };

    info!(reason = %reason, "captions: socket.io session ended");
    let _ = events.send(ChannelMessage::Disconnected(reason));
}

pub struct SocketIoConnection {
    events: broadcast::Sender<ChannelMessage>,
    // Receiver created before the pump starts, so nothing is lost before the first subscribe.
    initial: std::sync::Mutex<Option<broadcast::Receiver<ChannelMessage>>>,
    writer: SocketWriter,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

#[async_trait]
impl CaptionConnection for SocketIoConnection {
    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        if let Ok(mut initial) = self.initial.lock() {
            if let Some(rx) = initial.take() {
                return rx;
            }
        }
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pump.abort();

        let mut writer = self.writer.lock().await;
        let disconnect = EnginePacket::Message(SocketPacket::disconnect_default()).encode();
        if let Err(err) = writer.send(Message::Text(disconnect)).await {
            debug!(error = %err, "captions: disconnect packet not delivered");
        }
        if let Err(err) = writer.close().await {
            debug!(error = %err, "captions: websocket close failed");
        }
        Ok(())
    }
}

impl Drop for SocketIoConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
#[path = "tests/socket_io_tests.rs"]
mod tests;
