use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use vigil::events::RAW_LOG_KIND;
use vigil::{Event, LogLine};
use vigil_channel::{
    read_frame, write_frame, ChannelClient, ChannelEndpoint, ChannelError, ChannelMessage,
    INVALID_TOKEN_TXT, UNEXPECTED_MESSAGE_STR,
};

const QUEUE: usize = 10_000;
const WAIT: Duration = Duration::from_secs(5);

fn line(n: usize) -> Event {
    Event::Log(LogLine::new("INFO", format!("line {n}")).with_kind(RAW_LOG_KIND))
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let (endpoint, mut events) = ChannelEndpoint::open(QUEUE).await.expect("endpoint");
    let client = ChannelClient::connect(endpoint.port(), endpoint.token())
        .await
        .expect("client should register");

    for n in 0..200 {
        assert!(client.send(&line(n)));
    }

    for n in 0..200 {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("queue open");
        match event {
            Event::Log(log) => assert_eq!(log.message, format!("line {n}")),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(client.dropped(), 0);

    endpoint.release().await;
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let (endpoint, _events) = ChannelEndpoint::open(QUEUE).await.expect("endpoint");

    match ChannelClient::connect(endpoint.port(), "not-the-secret").await {
        Err(ChannelError::Rejected(reason)) => assert_eq!(reason, INVALID_TOKEN_TXT),
        other => panic!("expected rejection, got {other:?}"),
    }

    let good = ChannelClient::connect(endpoint.port(), endpoint.token()).await;
    assert!(good.is_ok(), "a rejected peer must not poison the endpoint");

    endpoint.release().await;
}

#[tokio::test]
async fn publish_before_registration_is_refused() {
    let (endpoint, mut events) = ChannelEndpoint::open(QUEUE).await.expect("endpoint");
    let stream = TcpStream::connect(("127.0.0.1", endpoint.port())).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let payload = line(0).encode().unwrap();
    write_frame(&mut writer, &ChannelMessage::Publish { payload }).await.unwrap();

    let response = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    match response {
        Some(ChannelMessage::RegistrationResponse { success, error, .. }) => {
            assert!(!success);
            assert_eq!(error.as_deref(), Some(UNEXPECTED_MESSAGE_STR));
        }
        other => panic!("expected a failed registration, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    endpoint.release().await;
}

#[tokio::test]
async fn registered_clients_are_tracked() {
    let (endpoint, _events) = ChannelEndpoint::open(QUEUE).await.expect("endpoint");
    let client = ChannelClient::connect(endpoint.port(), endpoint.token())
        .await
        .expect("client should register");

    let mut clients = Vec::new();
    for _ in 0..50 {
        clients = endpoint.registered_clients().await.unwrap();
        if !clients.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(clients, vec![client.client_id().to_string()]);

    endpoint.release().await;
}

#[tokio::test]
async fn unknown_event_kinds_are_skipped() {
    let (endpoint, mut events) = ChannelEndpoint::open(QUEUE).await.expect("endpoint");
    let stream = TcpStream::connect(("127.0.0.1", endpoint.port())).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    write_frame(
        &mut writer,
        &ChannelMessage::RegistrationRequest {
            token: endpoint.token().to_string(),
        },
    )
    .await
    .unwrap();
    let response = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert!(matches!(
        response,
        Some(ChannelMessage::RegistrationResponse { success: true, .. })
    ));

    write_frame(
        &mut writer,
        &ChannelMessage::Publish {
            payload: br#"{"type":"heartbeat","data":{}}"#.to_vec(),
        },
    )
    .await
    .unwrap();
    write_frame(
        &mut writer,
        &ChannelMessage::Publish {
            payload: line(7).encode().unwrap(),
        },
    )
    .await
    .unwrap();

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, Event::Log(ref log) if log.message == "line 7"));

    endpoint.release().await;
}

#[tokio::test]
async fn endpoints_get_distinct_ports_and_secrets() {
    let (a, _ea) = ChannelEndpoint::open(QUEUE).await.unwrap();
    let (b, _eb) = ChannelEndpoint::open(QUEUE).await.unwrap();

    assert_ne!(a.port(), b.port());
    assert_ne!(a.token(), b.token());
    let vars = a.env_vars();
    assert_eq!(vars[0].1, a.port().to_string());
    assert_eq!(vars[1].1, a.token());

    a.release().await;
    b.release().await;
}
