use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

const OPEN_FRAME: &str =
    r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

#[derive(Clone, Copy)]
enum Mode {
    Accept,
    Reject,
    DropNamespace,
}

#[derive(Clone)]
struct ServerState {
    mode: Mode,
    frames: mpsc::UnboundedSender<String>,
    queries: mpsc::UnboundedSender<HashMap<String, String>>,
}

struct TestServer {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<String>,
    queries: mpsc::UnboundedReceiver<HashMap<String, String>>,
}

impl TestServer {
    async fn next_frame(&mut self) -> String {
        timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("frame timeout")
            .expect("server gone")
    }
}

async fn spawn_server(mode: Mode) -> TestServer {
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (queries_tx, queries) = mpsc::unbounded_channel();
    let state = ServerState {
        mode,
        frames: frames_tx,
        queries: queries_tx,
    };

    let app = Router::new()
        .route("/socket.io/", get(socket_io_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer {
        addr,
        frames,
        queries,
    }
}

async fn socket_io_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let _ = state.queries.send(query);
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

async fn serve_socket(state: ServerState, mut socket: WebSocket) {
    if socket
        .send(WsMessage::Text(OPEN_FRAME.to_string()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let WsMessage::Text(frame) = message else {
            continue;
        };
        let _ = state.frames.send(frame.clone());

        let replies: Vec<&str> = match (frame.as_str(), state.mode) {
            ("40", Mode::Accept) => vec![r#"40{"sid":"ns-1"}"#, "2"],
            ("40", Mode::Reject) => vec![r#"44{"message":"meeting not found"}"#],
            ("40", Mode::DropNamespace) => vec![r#"40{"sid":"ns-1"}"#, "41"],
            ("3", _) => vec![
                r#"42["participant_joined",{"userId":"someone"}]"#,
                r#"42["translation_result",{"text":"HELLO","language":"en"}]"#,
            ],
            ("41", _) => break,
            _ => Vec::new(),
        };
        for reply in replies {
            if socket.send(WsMessage::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn params() -> CaptionChannelParams {
    CaptionChannelParams {
        meeting_id: "standup42".to_string(),
        user_id: "participant-7".to_string(),
        user_name: "Grace Hopper".to_string(),
    }
}

async fn next_message(messages: &mut broadcast::Receiver<ChannelMessage>) -> ChannelMessage {
    timeout(Duration::from_secs(5), messages.recv())
        .await
        .expect("message timeout")
        .expect("channel closed")
}

#[test]
fn channel_url_targets_socket_io_endpoint() {
    let url = channel_url("https://captions.example.com/api?stale=1", &params()).expect("url");

    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/socket.io/");
    assert_eq!(
        url.query(),
        Some("EIO=4&transport=websocket&meetingId=standup42&userId=participant-7&userName=Grace+Hopper")
    );
    assert_eq!(
        channel_url("http://localhost:5000", &params())
            .expect("url")
            .scheme(),
        "ws"
    );
}

#[test]
fn channel_url_rejects_unsupported_scheme() {
    assert!(matches!(
        channel_url("ftp://captions.example.com", &params()),
        Err(ChannelError::Connect(_))
    ));
    assert!(matches!(
        channel_url("not a url", &params()),
        Err(ChannelError::Connect(_))
    ));
}

#[tokio::test]
async fn captions_flow_after_handshake() {
    let mut server = spawn_server(Mode::Accept).await;
    let connector = SocketIoConnector::new(format!("http://{}", server.addr));

    let connection = connector.connect(params()).await.expect("connect");
    let mut messages = connection.subscribe();

    let query = server.queries.recv().await.expect("query");
    assert_eq!(query.get("EIO").map(String::as_str), Some("4"));
    assert_eq!(query.get("transport").map(String::as_str), Some("websocket"));
    assert_eq!(query.get("meetingId").map(String::as_str), Some("standup42"));
    assert_eq!(query.get("userName").map(String::as_str), Some("Grace Hopper"));

    assert_eq!(server.next_frame().await, "40");
    assert_eq!(server.next_frame().await, "3");

    match next_message(&mut messages).await {
        ChannelMessage::Caption(event) => assert_eq!(event.text, "HELLO"),
        other => panic!("unexpected message: {other:?}"),
    }

    connection.close().await.expect("close");
    assert_eq!(server.next_frame().await, "41");
    connection.close().await.expect("second close");
}

#[tokio::test]
async fn rejected_namespace_fails_connect() {
    let server = spawn_server(Mode::Reject).await;
    let connector = SocketIoConnector::new(format!("http://{}", server.addr));

    let err = match connector.connect(params()).await {
        Ok(_) => panic!("connect should be rejected"),
        Err(err) => err,
    };
    assert_eq!(
        err.downcast_ref::<ChannelError>(),
        Some(&ChannelError::Rejected(
            r#"{"message":"meeting not found"}"#.to_string()
        ))
    );
}

#[tokio::test]
async fn server_disconnect_is_forwarded() {
    let server = spawn_server(Mode::DropNamespace).await;
    let connector = SocketIoConnector::new(format!("http://{}", server.addr));

    let connection = connector.connect(params()).await.expect("connect");
    let mut messages = connection.subscribe();

    assert!(matches!(
        next_message(&mut messages).await,
        ChannelMessage::Disconnected(_)
    ));
}

#[tokio::test]
async fn unreachable_backend_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let connector = SocketIoConnector::new(format!("http://{addr}"));
    let err = match connector.connect(params()).await {
        Ok(_) => panic!("connect should fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ChannelError>(),
        Some(ChannelError::Connect(_))
    ));
}
