//! Integration tests for the control-protocol client against a fake
//! topic endpoint.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use world_warden::session::topic::TopicClient;
use world_warden::AppError;

use super::test_helpers::spawn_topic_server;

#[tokio::test]
async fn send_returns_the_response_line() {
    let server = spawn_topic_server(Duration::ZERO, |line| {
        assert!(line.starts_with("token "), "token must prefix the request");
        "pong".to_owned()
    })
    .await;

    let client = TopicClient::new("token".into(), Duration::from_secs(2));
    let cancel = CancellationToken::new();

    let response = client.send(server.port, "ping", &cancel).await.expect("send");
    assert_eq!(response, "pong");
    assert_eq!(server.served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_endpoint_is_a_communication_error() {
    // Bind then drop a listener so the port is known-dead.
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let client = TopicClient::new("token".into(), Duration::from_secs(1));
    let err = client
        .send(port, "ping", &CancellationToken::new())
        .await
        .expect_err("must fail");

    assert!(matches!(err, AppError::Communication(_)));
}

#[tokio::test]
async fn slow_endpoint_times_out_and_releases_the_slot() {
    let server = spawn_topic_server(Duration::from_secs(5), |_| "late".to_owned()).await;

    let client = TopicClient::new("token".into(), Duration::from_millis(200));
    let err = client
        .send(server.port, "ping", &CancellationToken::new())
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout(_)));

    // The client is stateless per request; a healthy endpoint works
    // immediately afterwards.
    let healthy = spawn_topic_server(Duration::ZERO, |_| "pong".to_owned()).await;
    let response = client
        .send(healthy.port, "ping", &CancellationToken::new())
        .await
        .expect("send");
    assert_eq!(response, "pong");
}

#[tokio::test]
async fn cancel_signal_wins_over_a_slow_response() {
    let server = spawn_topic_server(Duration::from_secs(5), |_| "late".to_owned()).await;

    let client = TopicClient::new("token".into(), Duration::from_secs(10));
    let cancel = CancellationToken::new();

    let cancel_trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_trigger.cancel();
    });

    let err = client
        .send(server.port, "ping", &cancel)
        .await
        .expect_err("must be cancelled");
    assert!(matches!(err, AppError::Cancelled(_)));
}

#[tokio::test]
async fn delimiter_in_command_is_rejected_before_the_wire() {
    let server = spawn_topic_server(Duration::ZERO, |_| "pong".to_owned()).await;

    let client = TopicClient::new("token".into(), Duration::from_secs(2));
    let err = client
        .send(server.port, "ping\nextra", &CancellationToken::new())
        .await
        .expect_err("must fail");

    assert!(matches!(err, AppError::Invalid(_)));
    assert_eq!(server.served.load(Ordering::SeqCst), 0);
}
