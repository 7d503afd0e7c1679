//! Shared helpers for integration tests: boot the server on a random port
//! and drive it over HTTP and WebSocket.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use beacon_server::auth::{JwtVerifier, Principal};
use beacon_server::config::Config;
use beacon_server::error::DeliveryError;
use beacon_server::push::model::PushSubscription;
use beacon_server::push::sender::{PushPayload, PushSender};
use beacon_server::state::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Push sender that only remembers where it would have pushed.
#[derive(Default)]
pub struct CapturingPushSender {
    pub sent: Mutex<Vec<(String, PushPayload)>>,
}

#[async_trait]
impl PushSender for CapturingPushSender {
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((subscription.endpoint.clone(), payload.clone()));
        Ok(())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub state: AppState,
    pub verifier: JwtVerifier,
    pub push: Arc<CapturingPushSender>,
    _data_dir: tempfile::TempDir,
}

impl TestServer {
    pub fn token(&self, user_id: &str, agency_id: Option<&str>, role: &str) -> String {
        let principal = Principal {
            user_id: user_id.to_string(),
            agency_id: agency_id.map(str::to_string),
            role: role.to_string(),
        };
        self.verifier.issue(&principal, 900).unwrap()
    }

    pub async fn connect(&self, token: &str) -> WsStream {
        let url = format!("ws://{}/ws?token={}", self.addr, token);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Failed to connect WebSocket");
        ws
    }
}

/// Start the server on a random port with the feed dispatcher running.
pub async fn start_test_server() -> TestServer {
    let data_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dir = data_dir.path().to_str().unwrap().to_string();

    let db = beacon_server::db::init_db(&dir).expect("Failed to init DB");
    let secret = beacon_server::auth::jwt::load_or_generate_jwt_secret(&dir)
        .expect("Failed to generate JWT secret");
    let verifier = JwtVerifier::new(secret);
    let push = Arc::new(CapturingPushSender::default());

    let config = Config {
        data_dir: dir,
        ..Config::default()
    };
    let state = AppState::new(db, config, Arc::new(verifier.clone()), push.clone());
    beacon_server::notify::dispatch::spawn_dispatcher(state.clone())
        .await
        .expect("Failed to start dispatcher");

    let app = beacon_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        base_url: format!("http://{}", addr),
        state,
        verifier,
        push,
        _data_dir: data_dir,
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Read frames until an event named `name` arrives. Panics after 3 seconds.
pub async fn expect_event(ws: &mut WsStream, name: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout_at(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for {}", name))
            .expect("Stream ended")
            .expect("Receive failed");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).expect("Frame is not JSON");
            if value["event"] == name {
                return value["payload"].clone();
            }
        }
    }
}

/// Assert no event named `name` arrives within `window`.
pub async fn expect_no_event(ws: &mut WsStream, name: &str, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_ne!(value["event"], name, "Unexpected {} event: {}", name, value);
            }
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}
