//! Boots the full gateway on an ephemeral port and drives it over real
//! HTTP and WebSocket connections.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use livetrack_gateway::api;
use livetrack_gateway::app_state::AppState;
use livetrack_gateway::auth::{IdentityValidator, StaticTokenValidator};
use livetrack_gateway::client::{ClientConfig, ClientSession, ConnectionState, Connector, WidgetUpdate, WsConnector};
use livetrack_gateway::clock::SystemClock;
use livetrack_gateway::config::GatewayConfig;
use livetrack_gateway::domain::{SubscriptionOptions, WidgetId, WidgetType};
use livetrack_gateway::error::GatewayError;
use livetrack_gateway::resilience::NoSnapshotProvider;
use livetrack_gateway::service::DistributionService;
use livetrack_gateway::ws::messages::ServerMessage;

const TOKENS: &str = "view-token:wallboard:viewer,ops-token:ingest:operator";

struct Gateway {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
}

async fn boot() -> Gateway {
    let config = GatewayConfig {
        auth_tokens: TOKENS.to_string(),
        ..GatewayConfig::default()
    };
    let validator: Arc<dyn IdentityValidator> = Arc::new(StaticTokenValidator::parse(TOKENS).unwrap());
    let service = Arc::new(DistributionService::new(
        &config,
        validator,
        Arc::new(NoSnapshotProvider),
        Arc::new(SystemClock),
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let _tasks = service.spawn_background_tasks(shutdown_rx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::build_app(AppState::new(service));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Gateway {
        addr,
        _shutdown: shutdown,
    }
}

fn tag_read(location: &str) -> Value {
    json!({
        "source_id": "reader-gw-2",
        "payload": {
            "event_type": "tag_read",
            "tag_id": "E200-3412",
            "asset_id": "pallet-7",
            "reader_id": "rdr-9",
            "location_id": location
        }
    })
}

#[tokio::test]
async fn health_endpoint_responds() {
    let gateway = boot().await;
    let response = reqwest::get(format!("http://{}/health", gateway.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn published_event_reaches_subscribed_client() {
    let gateway = boot().await;
    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(
        format!("ws://{}/ws", gateway.addr),
        Some("view-token".to_string()),
        false,
    ));
    let session = Arc::new(ClientSession::new(connector, ClientConfig::default()));

    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let widget_id = WidgetId::new("dock-map").unwrap();
    session.subscribe(
        widget_id.clone(),
        WidgetType::AssetLocation,
        SubscriptionOptions::default(),
        move |update: &WidgetUpdate| {
            let _ = updates_tx.send(update.clone());
            Ok(())
        },
    );
    session.connect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    // Let the replayed subscribe land before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let http = reqwest::Client::new();
    let response = http
        .post(format!("http://{}/api/v1/events", gateway.addr))
        .bearer_auth("ops-token")
        .json(&tag_read("dock-3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let update = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await {
                Some(WidgetUpdate::Events { events, .. }) => return events,
                Some(_) => {}
                None => panic!("session dropped"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update.len(), 1);
    assert_eq!(update.first().unwrap()["location_id"], "dock-3");

    session.close();
}

#[tokio::test]
async fn viewer_may_not_publish() {
    let gateway = boot().await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/api/v1/events", gateway.addr))
        .bearer_auth("view-token")
        .json(&tag_read("dock-3"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_token_is_rejected_then_closed() {
    let gateway = boot().await;
    let url = format!("ws://{}/ws?token=nope", gateway.addr);
    let (mut stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let Some(Ok(Message::Text(text))) = stream.next().await else {
        panic!("expected error frame");
    };
    let ServerMessage::Error { code, .. } = ServerMessage::parse(text.as_str()).unwrap() else {
        panic!("expected error message");
    };
    assert_eq!(code, "authentication_failed");

    let next = stream.next().await;
    assert!(matches!(next, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
}

#[tokio::test]
async fn client_session_surfaces_authentication_failure() {
    let gateway = boot().await;
    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(
        format!("ws://{}/ws", gateway.addr),
        Some("nope".to_string()),
        false,
    ));
    let session = Arc::new(ClientSession::new(connector, ClientConfig::default()));
    let seen = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&seen);
    session.subscribe(
        WidgetId::new("feed").unwrap(),
        WidgetType::ActivityFeed,
        SubscriptionOptions::default(),
        move |_| {
            *counter.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            Ok(())
        },
    );

    assert!(matches!(
        session.connect().await,
        Err(GatewayError::Authentication(_))
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(*seen.lock().unwrap_or_else(PoisonError::into_inner), 0);
}
