use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use ring::hmac;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use trellis_core::config::{WebhookConfig, WebhookRoute};
use trellis_core::error::Result;
use trellis_core::event::{AgentEvent, EventBus, EventPayload};

/// Header carrying the hex HMAC-SHA256 of the request body.
const SIGNATURE_HEADER: &str = "x-signature";

/// Embedded HTTP listener publishing WEBHOOK_RECEIVED events. Only started
/// when the runtime config declares at least one route.
pub struct WebhookListener {
    config: WebhookConfig,
    bus: EventBus,
}

impl WebhookListener {
    pub fn new(config: WebhookConfig, bus: EventBus) -> Self {
        Self { config, bus }
    }

    fn router(&self) -> Router {
        let mut router = Router::new();
        for route in &self.config.routes {
            let bus = self.bus.clone();
            let route_cfg = route.clone();
            router = router.route(
                &route.path,
                post(move |headers: HeaderMap, body: Bytes| {
                    let bus = bus.clone();
                    let route_cfg = route_cfg.clone();
                    async move { handle_webhook(route_cfg, bus, headers, body).await }
                }),
            );
        }
        router.layer(CorsLayer::permissive())
    }

    /// Serve until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, routes = self.config.routes.len(), "webhook listener up");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Handle one delivery: verify the signature when the route has a secret,
/// then publish the event. Verification failure is a 401 and no event.
async fn handle_webhook(
    route: WebhookRoute,
    bus: EventBus,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if let Some(secret) = &route.secret {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("sha256=").to_string());
        let verified = provided
            .and_then(|hex| hex_decode(&hex))
            .map(|sig| {
                let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
                hmac::verify(&key, &body, &sig).is_ok()
            })
            .unwrap_or(false);
        if !verified {
            warn!(source_id = %route.source_id, "webhook signature verification failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "invalid signature"})),
            )
                .into_response();
        }
    }

    let body_value: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    let header_map: serde_json::Map<String, Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect();

    info!(source_id = %route.source_id, "webhook received");
    bus.publish(AgentEvent::new(EventPayload::WebhookReceived {
        source_id: route.source_id.clone(),
        headers: Value::Object(header_map),
        body: body_value,
    }));

    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "received"})),
    )
        .into_response()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::event::{EventFilter, EventType};

    fn hex_encode(bytes: &[u8]) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        hex_encode(hmac::sign(&key, body).as_ref())
    }

    fn route(secret: Option<&str>) -> WebhookRoute {
        WebhookRoute {
            source_id: "gh".into(),
            path: "/hooks/gh".into(),
            secret: secret.map(String::from),
        }
    }

    #[tokio::test]
    async fn unsigned_route_publishes_event() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::for_type(EventType::WebhookReceived));

        let response = handle_webhook(
            route(None),
            bus,
            HeaderMap::new(),
            Bytes::from_static(br#"{"ref": "main"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::WebhookReceived { source_id, body, .. } => {
                assert_eq!(source_id, "gh");
                assert_eq!(body["ref"], "main");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_signature_accepted() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::for_type(EventType::WebhookReceived));

        let body = br#"{"action": "opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign("shh", body).parse().unwrap(),
        );

        let response =
            handle_webhook(route(Some("shh")), bus, headers, Bytes::from_static(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn bad_signature_is_401_and_no_event() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::for_type(EventType::WebhookReceived));

        let body = br#"{"action": "opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign("wrong-secret", body).parse().unwrap(),
        );

        let response =
            handle_webhook(route(Some("shh")), bus.clone(), headers, Bytes::from_static(body))
                .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn missing_signature_is_401() {
        let bus = EventBus::default();
        let response = handle_webhook(
            route(Some("shh")),
            bus,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn hex_roundtrip() {
        assert_eq!(hex_decode("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(hex_decode("0g"), None);
        assert_eq!(hex_decode("abc"), None);
    }

    #[tokio::test]
    async fn non_json_body_is_preserved_as_string() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::for_type(EventType::WebhookReceived));
        handle_webhook(
            route(None),
            bus,
            HeaderMap::new(),
            Bytes::from_static(b"plain text payload"),
        )
        .await;
        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::WebhookReceived { body, .. } => {
                assert_eq!(body, Value::String("plain text payload".into()));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
