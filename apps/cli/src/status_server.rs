//! Local status server.
//!
//! `GET /stream` sends every status event as a server-sent event carrying the
//! `op`-tagged JSON. `POST /signal` with `{"deviceId": ".."}` asks the cloud
//! to signal that device and returns immediately.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use prov_core::{AssetSource, BroadcastObserver, CloudApi, FlashTool, Orchestrator, StatusEvent, UsbBackend};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Fire-and-forget device signaling. Outcomes are reported as status events.
pub trait Signaler: Send + Sync + 'static {
    fn signal(self: Arc<Self>, device_id: String);
}

impl<C, A, U, T> Signaler for Orchestrator<C, A, U, T>
where
    C: CloudApi,
    A: AssetSource,
    U: UsbBackend,
    T: FlashTool,
{
    fn signal(self: Arc<Self>, device_id: String) {
        tokio::spawn(async move {
            self.signal_device(&device_id).await;
        });
    }
}

#[derive(Clone)]
struct AppState {
    events: Arc<BroadcastObserver>,
    signaler: Arc<dyn Signaler>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalRequest {
    #[serde(default)]
    device_id: Option<String>,
}

pub fn router(events: Arc<BroadcastObserver>, signaler: Arc<dyn Signaler>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/signal", post(signal))
        .with_state(AppState { events, signaler })
}

/// Bind to localhost and serve until the process exits.
pub async fn serve(port: u16, events: Arc<BroadcastObserver>, signaler: Arc<dyn Signaler>) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!("server: http://localhost:{port}/");
    axum::serve(listener, router(events, signaler)).await?;
    Ok(())
}

fn to_sse(event: &StatusEvent) -> Option<Event> {
    match Event::default().json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(error = %e, "Failed to encode status event");
            None
        }
    }
}

async fn stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.events.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => to_sse(&event).map(Ok),
            Err(e) => {
                debug!(error = %e, "Status stream subscriber lagged");
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn signal(State(state): State<AppState>, Json(req): Json<SignalRequest>) -> Json<Value> {
    if let Some(id) = req.device_id.filter(|id| !id.is_empty()) {
        state.signaler.clone().signal(id);
    }
    Json(json!({}))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use prov_core::StatusObserver;

    #[derive(Default)]
    struct RecordingSignaler {
        ids: Mutex<Vec<String>>,
    }

    impl Signaler for RecordingSignaler {
        fn signal(self: Arc<Self>, device_id: String) {
            self.ids.lock().unwrap().push(device_id);
        }
    }

    async fn start() -> (SocketAddr, Arc<BroadcastObserver>, Arc<RecordingSignaler>) {
        let events = Arc::new(BroadcastObserver::new(16));
        let signaler = Arc::new(RecordingSignaler::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(events.clone(), signaler.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, events, signaler)
    }

    #[tokio::test]
    async fn test_signal_forwards_device_id() {
        let (addr, _events, signaler) = start().await;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("http://{addr}/signal"))
            .json(&json!({"deviceId": "D1"}))
            .send()
            .await
            .unwrap();
        assert!(res.status().is_success());
        assert_eq!(res.text().await.unwrap(), "{}");

        // Missing id is accepted and ignored
        client
            .post(format!("http://{addr}/signal"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();

        assert_eq!(*signaler.ids.lock().unwrap(), vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_sends_status_events() {
        let (addr, events, _) = start().await;

        let mut res = reqwest::get(format!("http://{addr}/stream")).await.unwrap();
        assert_eq!(
            res.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        events.on_event(&StatusEvent::SetupDone { id: "D1".into() });
        let chunk = res.chunk().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("data: "), "{text}");
        assert!(text.contains(r#""op":"setupDone""#), "{text}");
        assert!(text.contains(r#""id":"D1""#), "{text}");
    }
}
