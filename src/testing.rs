//! Test helpers: a throwaway DeviceHub listening on localhost

use crate::devicehub::DeviceHubConnection;
use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
struct MockState {
    status: StatusCode,
    received: Arc<Mutex<Vec<Value>>>,
    authorizations: Arc<Mutex<Vec<Option<String>>>>,
}

pub struct MockDeviceHub {
    pub url: String,
    state: MockState,
}

impl MockDeviceHub {
    /// Serve a DeviceHub that answers every snapshot POST with `status`.
    pub async fn spawn(status: u16) -> Self {
        let state = MockState {
            status: StatusCode::from_u16(status).unwrap(),
            received: Arc::default(),
            authorizations: Arc::default(),
        };

        let app = Router::new()
            .route("/{db}/events/devices/snapshot", post(receive))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn connection(&self) -> DeviceHubConnection {
        DeviceHubConnection {
            url: self.url.clone(),
            db: "db1".into(),
            token: Some("Basic test".into()),
        }
    }

    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    pub async fn authorizations(&self) -> Vec<Option<String>> {
        self.state.authorizations.lock().await.clone()
    }
}

async fn receive(
    State(state): State<MockState>,
    Path(_db): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.authorizations.lock().await.push(auth);
    state.received.lock().await.push(body);
    state.status
}
