//! HTTP response classification, sanitization and truncation tests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use campaigner::delivery::ErrorClass;
use campaigner::providers::{check_http_response, ProviderError};

async fn serve_once(status_line: &str, extra_headers: &str, body: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose local addr");

    let status_line_owned = status_line.to_owned();
    let headers_owned = extra_headers.to_owned();
    let body_owned = body.to_owned();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut read_buf = [0_u8; 1024];
            let _ = socket.read(&mut read_buf).await;

            let response = format!(
                "HTTP/1.1 {status_line_owned}\r\nContent-Type: text/plain\r\n{headers_owned}Content-Length: {}\r\nConnection: close\r\n\r\n{body_owned}",
                body_owned.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    format!("http://{addr}/")
}

#[tokio::test]
async fn success_returns_body() {
    let url = serve_once("200 OK", "", "{\"id\":\"abc\"}").await;
    let response = reqwest::get(url).await.expect("request should complete");
    let body = check_http_response(response).await.expect("2xx is ok");
    assert_eq!(body, "{\"id\":\"abc\"}");
}

#[tokio::test]
async fn rate_limited_carries_retry_after() {
    let url = serve_once("429 Too Many Requests", "Retry-After: 7\r\n", "slow down").await;
    let response = reqwest::get(url).await.expect("request should complete");

    let err = match check_http_response(response).await {
        Ok(_) => panic!("429 must fail"),
        Err(err) => err,
    };
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    assert!(matches!(err, ProviderError::RateLimited { .. }));
}

#[tokio::test]
async fn validation_error_is_permanent() {
    let url = serve_once("422 Unprocessable Entity", "", "invalid `to` field").await;
    let response = reqwest::get(url).await.expect("request should complete");

    let err = match check_http_response(response).await {
        Ok(_) => panic!("422 must fail"),
        Err(err) => err,
    };
    assert_eq!(err.class(), ErrorClass::Permanent);
    match err {
        ProviderError::HttpStatus { status, body } => {
            assert_eq!(status, 422);
            assert_eq!(body, "invalid `to` field");
        }
        other => panic!("expected http status error, got: {other}"),
    }
}

#[tokio::test]
async fn server_error_is_transient() {
    let url = serve_once("503 Service Unavailable", "", "try later").await;
    let response = reqwest::get(url).await.expect("request should complete");
    let err = match check_http_response(response).await {
        Ok(_) => panic!("503 must fail"),
        Err(err) => err,
    };
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(err.retry_after(), None);
}

#[tokio::test]
async fn error_body_redacts_api_keys() {
    let raw_key = "re_abcdefghijklmnopqrstuvwxyz1234";
    let body = format!("invalid api key {raw_key}");
    let url = serve_once("401 Unauthorized", "", &body).await;
    let response = reqwest::get(url).await.expect("request should complete");

    match check_http_response(response).await {
        Err(ProviderError::HttpStatus { body, .. }) => {
            assert!(!body.contains(raw_key));
            assert!(body.contains("[REDACTED]"));
        }
        other => panic!("expected http status error, got: {other:?}"),
    }
}

#[tokio::test]
async fn error_body_is_truncated() {
    let body = "x".repeat(400);
    let url = serve_once("500 Internal Server Error", "", &body).await;
    let response = reqwest::get(url).await.expect("request should complete");

    match check_http_response(response).await {
        Err(ProviderError::HttpStatus { body, .. }) => {
            assert!(body.ends_with("...[truncated]"));
            assert!(body.chars().count() < 400);
        }
        other => panic!("expected http status error, got: {other:?}"),
    }
}
