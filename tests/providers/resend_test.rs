//! Resend client wire format and HTTP behaviour.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use campaigner::config::ProviderConfig;
use campaigner::delivery::{ErrorClass, OutgoingMessage};
use campaigner::providers::resend::{build_request, parse_response, ResendClient};
use campaigner::providers::{ProviderClient, ProviderError, SendRequest};

/// Answer one request and hand back its raw text.
async fn serve_once(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose local addr");
    let (captured_tx, captured_rx) = oneshot::channel();

    let status_line_owned = status_line.to_owned();
    let body_owned = body.to_owned();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut request = Vec::new();
            let mut chunk = [0_u8; 4096];
            loop {
                let read = socket.read(&mut chunk).await.unwrap_or(0);
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
                if request_complete(&request) {
                    break;
                }
            }
            let _ = captured_tx.send(String::from_utf8_lossy(&request).into_owned());

            let response = format!(
                "HTTP/1.1 {status_line_owned}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body_owned}",
                body_owned.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    (format!("http://{addr}"), captured_rx)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..header_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    text.len() >= header_end.saturating_add(4).saturating_add(content_length)
}

fn provider_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: base_url.to_owned(),
        from_email: "news@example.com".to_owned(),
        from_name: "Example News".to_owned(),
        ..ProviderConfig::default()
    }
}

fn request() -> SendRequest {
    let message = OutgoingMessage::new(
        "spring",
        "ada@example.com",
        "Spring sale",
        "<p>Hello Ada</p>",
        "Hello Ada",
    )
    .with_recipient_name("Ada");
    SendRequest::for_message(&message, "Example News <news@example.com>")
}

#[tokio::test]
async fn send_posts_message_with_idempotency_key() {
    let (base_url, captured) = serve_once("200 OK", "{\"id\":\"msg_123\"}").await;
    let client = ResendClient::new(&provider_config(&base_url), Some("re_test_key".to_owned()));
    let request = request();
    let key = request.idempotency_key.clone().expect("dedup key set");

    let receipt = client.send(&request).await.expect("send should succeed");
    assert_eq!(receipt.provider_message_id, "msg_123");

    let raw = captured.await.expect("request captured").to_lowercase();
    assert!(raw.starts_with("post /emails "), "unexpected request line: {raw}");
    assert!(raw.contains("authorization: bearer re_test_key"));
    assert!(raw.contains(&format!("idempotency-key: {key}")));
    assert!(raw.contains("\"to\":[\"ada <ada@example.com>\"]"));
    assert!(raw.contains("\"from\":\"example news <news@example.com>\""));
}

#[tokio::test]
async fn rejected_recipient_is_permanent() {
    let (base_url, _captured) =
        serve_once("422 Unprocessable Entity", "{\"message\":\"invalid to\"}").await;
    let client = ResendClient::new(&provider_config(&base_url), Some("re_test_key".to_owned()));

    let err = match client.send(&request()).await {
        Ok(receipt) => panic!("422 must fail, got {receipt:?}"),
        Err(err) => err,
    };
    assert_eq!(err.class(), ErrorClass::Permanent);
}

#[tokio::test]
async fn missing_api_key_fails_without_network() {
    let client = ResendClient::new(&provider_config("http://127.0.0.1:9"), Some("  ".to_owned()));
    assert!(matches!(
        client.check_ready(),
        Err(ProviderError::NotConfigured(_))
    ));
    let err = match client.send(&request()).await {
        Ok(receipt) => panic!("send without key must fail, got {receipt:?}"),
        Err(err) => err,
    };
    assert!(matches!(err, ProviderError::NotConfigured(_)));
    assert_eq!(err.class(), ErrorClass::Permanent);
}

#[test]
fn endpoint_ignores_trailing_slash() {
    let client = ResendClient::new(&provider_config("https://api.example.com/"), None);
    assert_eq!(client.endpoint(), "https://api.example.com/emails");
    assert_eq!(client.name(), "resend");
    assert_eq!(client.from_header(), "Example News <news@example.com>");
}

#[test]
fn build_request_omits_empty_bodies() {
    let mut request = request();
    request.text_body.clear();
    let wire = build_request(&request);
    assert_eq!(wire.to, vec!["Ada <ada@example.com>".to_owned()]);
    assert_eq!(wire.html.as_deref(), Some("<p>Hello Ada</p>"));
    assert!(wire.text.is_none());

    let json = serde_json::to_value(&wire).expect("serialize");
    assert!(json.get("text").is_none());
}

#[test]
fn parse_response_requires_id() {
    let receipt = parse_response("{\"id\":\"abc\"}").expect("valid body");
    assert_eq!(receipt.provider_message_id, "abc");
    assert!(matches!(
        parse_response("{\"id\":\"\"}"),
        Err(ProviderError::Parse(_))
    ));
    assert!(matches!(parse_response("not json"), Err(ProviderError::Parse(_))));
}
