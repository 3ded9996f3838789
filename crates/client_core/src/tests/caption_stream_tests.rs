use super::*;
use crate::test_support::{identity, FakeCaptionConnector};
use tokio::sync::Notify;

#[test]
fn params_follow_session_identity() {
    let params = CaptionChannelParams::for_session(&identity());

    assert_eq!(
        params.query_pairs(),
        [
            ("meetingId", "standup42"),
            ("userId", "participant-7"),
            ("userName", "Grace"),
        ]
    );
}

#[tokio::test]
async fn connect_delivers_channel_messages() {
    let connector = Arc::new(FakeCaptionConnector::new());
    let stream = CaptionStream::new(connector.clone(), Duration::from_secs(10));

    let mut messages = stream.connect(&identity()).await.expect("connect");
    connector.connection.push_caption("good morning");

    match messages.recv().await.expect("message") {
        ChannelMessage::Caption(event) => assert_eq!(event.text, "good morning"),
        other => panic!("unexpected message: {other:?}"),
    }
    assert_eq!(connector.params().await.len(), 1);
}

#[tokio::test]
async fn connector_errors_keep_their_kind() {
    let connector = Arc::new(
        FakeCaptionConnector::new().failing(ChannelError::Rejected("bad meeting".to_string())),
    );
    let stream = CaptionStream::new(connector, Duration::from_secs(10));

    assert_eq!(
        stream.connect(&identity()).await.map(|_| ()),
        Err(ChannelError::Rejected("bad meeting".to_string()))
    );
}

#[tokio::test]
async fn missing_connector_reports_connect_failure() {
    let stream = CaptionStream::new(Arc::new(MissingCaptionConnector), Duration::from_secs(10));

    assert_eq!(
        stream.connect(&identity()).await.map(|_| ()),
        Err(ChannelError::Connect("caption backend is unavailable".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn hanging_connect_times_out() {
    let stream = CaptionStream::new(
        Arc::new(FakeCaptionConnector::new().hanging()),
        Duration::from_secs(4),
    );

    assert_eq!(
        stream.connect(&identity()).await.map(|_| ()),
        Err(ChannelError::Timeout(Duration::from_secs(4)))
    );
}

#[tokio::test]
async fn disconnect_closes_once() {
    let connector = Arc::new(FakeCaptionConnector::new());
    let stream = CaptionStream::new(connector.clone(), Duration::from_secs(10));
    stream.connect(&identity()).await.expect("connect");

    assert!(stream.disconnect().await);
    assert!(!stream.disconnect().await);
    assert_eq!(connector.connection.closes(), 1);
}

#[tokio::test]
async fn connection_after_disconnect_is_closed() {
    let gate = Arc::new(Notify::new());
    let connector = Arc::new(FakeCaptionConnector::new().gated(gate.clone()));
    let stream = Arc::new(CaptionStream::new(connector.clone(), Duration::from_secs(10)));

    let connecting = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.connect(&identity()).await.map(|_| ()) })
    };
    tokio::task::yield_now().await;

    assert!(!stream.disconnect().await);
    gate.notify_one();

    assert_eq!(connecting.await.expect("join"), Err(ChannelError::Closed));
    assert_eq!(connector.connection.closes(), 1);
}
