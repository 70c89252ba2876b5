//! Helper exchanges over in-process and Unix socket channels.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use langhost_helper::message::{encode, read_frame, write_frame};
use langhost_helper::{
    ExchangeOutcome, HelperClient, HelperConfig, HelperError, HelperServer, ProfileHandler,
    ProfileRequest, ProfileResponse, Secret, serve_exchange,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_test::assert_ok;

#[derive(Default)]
struct Profiles {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ProfileHandler for Profiles {
    async fn handle(&self, request: ProfileRequest) -> ProfileResponse {
        self.seen.lock().unwrap().push(request.username.clone());
        if request.password.expose().is_empty() {
            return ProfileResponse::failed(1326);
        }
        ProfileResponse::found(format!("/profiles/{}/{}", request.domain, request.username), true)
    }
}

fn config() -> HelperConfig {
    HelperConfig::with_channel("/unused.sock")
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(1))
}

fn request(password: &str) -> ProfileRequest {
    ProfileRequest {
        username: "ana".to_string(),
        domain: "LAB".to_string(),
        password: Secret::new(password),
    }
}

#[tokio::test]
async fn test_exchange_completes() {
    let (client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    let config = config();
    let client = HelperClient::new(config.clone());

    let server = serve_exchange(server_end, &handler, &config);
    let req = request("pw");
    let call = client.exchange(client_end, &req);
    let (outcome, response) = tokio::join!(server, call);

    assert_eq!(outcome, ExchangeOutcome::Completed);
    let response = response.unwrap();
    assert_eq!(response.error, 0);
    assert!(response.profile_exists);
    assert_eq!(response.profile_path, "/profiles/LAB/ana");
    assert_eq!(*handler.seen.lock().unwrap(), vec!["ana".to_string()]);
}

#[tokio::test]
async fn test_handler_failure_is_encoded_in_response() {
    let (client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    let config = config();
    let client = HelperClient::new(config.clone());

    let req = request("");
    let (outcome, response) = tokio::join!(
        serve_exchange(server_end, &handler, &config),
        client.exchange(client_end, &req)
    );
    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert_eq!(response.unwrap(), ProfileResponse::failed(1326));
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_disconnected_after_combined_timeout() {
    let (mut client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    let config = config();

    let started = Instant::now();
    let outcome = serve_exchange(server_end, &handler, &config).await;
    assert_eq!(outcome, ExchangeOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(handler.seen.lock().unwrap().is_empty());

    // The server dropped its end.
    let mut buf = [0u8; 8];
    assert_eq!(client_end.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_that_never_disconnects_is_cut_off() {
    let (mut client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    let config = config();

    let server = tokio::spawn(async move {
        let started = Instant::now();
        let outcome = serve_exchange(server_end, &handler, &config).await;
        (outcome, started.elapsed())
    });

    write_frame(&mut client_end, &request("pw")).await.unwrap();
    let response: ProfileResponse = read_frame(&mut client_end, 4096).await.unwrap();
    assert_eq!(response.error, 0);

    // The response was read but the client keeps the channel open.
    let (outcome, elapsed) = server.await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::TimedOut);
    assert!(elapsed >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_slow_reader_shares_the_same_deadline() {
    // Too small to hold the response, so the server blocks writing it.
    let (mut client_end, server_end) = tokio::io::duplex(16);
    let handler = Profiles::default();
    let config = config();

    let server = tokio::spawn(async move { serve_exchange(server_end, &handler, &config).await });
    client_end.write_all(&encode(&request("pw")).unwrap()).await.unwrap();

    assert_eq!(server.await.unwrap(), ExchangeOutcome::TimedOut);
}

#[tokio::test]
async fn test_oversized_request_gets_blank_response() {
    let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
    let handler = Profiles::default();
    let mut config = config();
    config.max_request_bytes = 32;

    let server = tokio::spawn(async move {
        let outcome = serve_exchange(server_end, &handler, &config).await;
        (outcome, handler.seen.lock().unwrap().len())
    });

    write_frame(&mut client_end, &request("pw")).await.unwrap();
    let response: ProfileResponse = read_frame(&mut client_end, 4096).await.unwrap();
    assert!(response.is_blank());
    client_end.shutdown().await.unwrap();

    let (outcome, handled) = server.await.unwrap();
    assert_eq!(outcome, ExchangeOutcome::Rejected);
    assert_eq!(handled, 0);
}

#[tokio::test]
async fn test_malformed_request_gets_blank_response() {
    let (mut client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    let config = config();
    let server = tokio::spawn(async move { serve_exchange(server_end, &handler, &config).await });

    // Valid frame header, body is not UTF-16 JSON.
    let mut frame = 5u32.to_le_bytes().to_vec();
    frame.extend_from_slice(b"{oops");
    client_end.write_all(&frame).await.unwrap();
    let response: ProfileResponse = read_frame(&mut client_end, 4096).await.unwrap();
    assert!(response.is_blank());
    drop(client_end);

    assert_eq!(server.await.unwrap(), ExchangeOutcome::Rejected);
}

#[tokio::test]
async fn test_client_leaving_early_is_not_an_error() {
    let (client_end, server_end) = tokio::io::duplex(4096);
    let handler = Profiles::default();
    drop(client_end);
    let outcome = serve_exchange(server_end, &handler, &config()).await;
    assert_eq!(outcome, ExchangeOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_client_times_out_on_silent_server() {
    let (client_end, _server_end) = tokio::io::duplex(4096);
    let client = HelperClient::new(config());
    let err = client.exchange(client_end, &request("pw")).await.unwrap_err();
    assert!(matches!(err, HelperError::Timeout(t) if t == Duration::from_secs(1)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_server_round_trip() {
    use tokio_util::sync::CancellationToken;

    let dir = tempfile::tempdir().unwrap();
    let channel = dir.path().join("run").join("helper.sock");
    let config = HelperConfig::with_channel(&channel);
    let server = HelperServer::new(config.clone(), Profiles::default());
    let shutdown = CancellationToken::new();

    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server.run(shutdown).await }
    });
    while !channel.exists() {
        tokio::task::yield_now().await;
    }

    let client = HelperClient::new(config);
    for user in ["ana", "ben"] {
        let mut req = request("pw");
        req.username = user.to_string();
        let response = client.request(&req).await.unwrap();
        assert_eq!(response.profile_path, format!("/profiles/LAB/{user}"));
    }

    shutdown.cancel();
    assert_ok!(running.await.unwrap());
    assert!(!channel.exists());
}
