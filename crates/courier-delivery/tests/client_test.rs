//! Integration tests for the HTTP delivery transport.
//!
//! Verifies the outbound request shape and that transport faults never
//! escape as errors.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use anyhow::Result;
use courier_delivery::{
    client::{ClientConfig, DeliveryClient, TransportFault, TransportResult},
    USER_AGENT,
};
use serde_json::json;
use tokio::time::timeout;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn posts_event_envelope_as_json() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hooks/orders"))
        .and(matchers::header("content-type", "application/json"))
        .and(matchers::header("user-agent", USER_AGENT))
        .and(matchers::body_json(json!({
            "event": "order.created",
            "payload": {"sku": "X", "qty": 2}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults()?;
    let result = client
        .send(
            &format!("{}/hooks/orders", server.uri()),
            "order.created",
            &json!({"sku": "X", "qty": 2}),
        )
        .await;

    let TransportResult::Completed(response) = result else {
        panic!("expected a completed exchange, got {result:?}");
    };
    assert_eq!(response.status_code, 200);
    Ok(())
}

#[tokio::test]
async fn null_payload_is_sent_verbatim() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::body_json(json!({"event": "ping", "payload": null})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults()?;
    let result = client.send(&server.uri(), "ping", &serde_json::Value::Null).await;

    assert!(matches!(result, TransportResult::Completed(ref r) if r.status_code == 204));
    Ok(())
}

#[tokio::test]
async fn client_does_not_retry_internally() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults()?;
    client.send(&server.uri(), "order.created", &json!({})).await;

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn timeout_never_hangs() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let client = DeliveryClient::new(ClientConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    })?;

    let result = timeout(
        Duration::from_secs(5),
        client.send(&server.uri(), "order.created", &json!({})),
    )
    .await
    .expect("send must resolve within its own deadline");

    assert_eq!(result, TransportResult::Faulted { kind: TransportFault::ConnectionFailure });
    Ok(())
}

#[tokio::test]
async fn dns_failure_collapses_to_connection_failure() -> Result<()> {
    let client = DeliveryClient::new(ClientConfig {
        timeout: Duration::from_secs(2),
        ..Default::default()
    })?;

    let url = "http://courier-test.invalid/webhook";
    let result = client.send(url, "order.created", &json!({})).await;

    assert_eq!(result, TransportResult::connection_failure());
    Ok(())
}

#[tokio::test]
async fn redirects_are_followed() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::path("/old"))
        .respond_with(
            ResponseTemplate::new(307).append_header("location", format!("{}/new", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(matchers::path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .mount(&server)
        .await;

    let client = DeliveryClient::with_defaults()?;
    let result = client.send(&format!("{}/old", server.uri()), "order.created", &json!({})).await;

    let TransportResult::Completed(response) = result else {
        panic!("expected a completed exchange");
    };
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "moved");
    Ok(())
}
