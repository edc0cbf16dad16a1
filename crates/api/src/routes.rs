use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use predsync_core::push::hub::PushHub;
use predsync_core::push::protocol::{ClientCommand, ServerEvent};
use predsync_core::store::{read_record, read_record_dir, SnapshotResponse};
use predsync_core::watch::{ChangedAspect, WatchNotification};

#[derive(Debug, Clone)]
pub struct AppState {
    pub predictions_dir: PathBuf,
    pub hub: Arc<PushHub>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predictions/daily", get(get_daily_predictions))
        .route("/api/prediction/:ticker", get(get_prediction))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "websocket_clients": state.hub.client_count(),
        "timestamp": Utc::now(),
    }))
}

async fn get_daily_predictions(
    State(state): State<AppState>,
) -> Result<Json<SnapshotResponse>, StatusCode> {
    let predictions = read_record_dir(&state.predictions_dir, ChangedAspect::Prediction)
        .await
        .map_err(|e| {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %format!("{e:#}"), "failed to read predictions");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(SnapshotResponse::new(predictions, Utc::now())))
}

async fn get_prediction(State(state): State<AppState>, Path(ticker): Path<String>) -> Response {
    let ticker = ticker.trim().to_uppercase();
    match read_record(&state.predictions_dir, &ticker, ChangedAspect::Prediction).await {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Prediction not found for {ticker}") })),
        )
            .into_response(),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(%ticker, error = %format!("{e:#}"), "failed to read prediction");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to read prediction" })),
            )
                .into_response()
        }
    }
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<PushHub>) {
    let (peer_id, mut frames) = hub.register();
    hub.send_to(peer_id, &ServerEvent::Connected);
    tracing::info!(%peer_id, clients = hub.client_count(), "push peer connected");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                // None: evicted by the hub.
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(&text) {
                        Ok(ClientCommand::Subscribe { ticker }) => {
                            hub.subscribe(peer_id, &ticker);
                            tracing::debug!(%peer_id, %ticker, "peer subscribed");
                        }
                        Err(err) => tracing::debug!(%peer_id, error = %err, "ignoring unrecognized client frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(%peer_id, error = %err, "push peer read failed");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(peer_id);
    tracing::info!(%peer_id, clients = hub.client_count(), "push peer disconnected");
}

/// Maps watcher output onto push events.
pub fn event_for(notification: WatchNotification) -> ServerEvent {
    match notification {
        WatchNotification::Changed {
            ticker,
            aspect: ChangedAspect::Prediction,
            payload,
        } => ServerEvent::PredictionUpdated {
            ticker,
            prediction: payload,
        },
        WatchNotification::Changed {
            ticker,
            aspect,
            payload,
        } => ServerEvent::DataUpdated {
            ticker,
            aspect,
            data: payload,
        },
        WatchNotification::FullSnapshot { predictions } => {
            ServerEvent::PredictionsRefresh { predictions }
        }
    }
}

pub async fn forward_notifications(
    mut notifications: tokio::sync::mpsc::Receiver<WatchNotification>,
    hub: Arc<PushHub>,
) {
    while let Some(notification) = notifications.recv().await {
        let event = event_for(notification);
        let delivered = hub.broadcast(&event);
        tracing::info!(ticker = event.ticker().unwrap_or("*"), delivered, "broadcast push event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn spawn_app(dir: &std::path::Path) -> (String, Arc<PushHub>) {
        let hub = Arc::new(PushHub::default());
        let app = router(AppState {
            predictions_dir: dir.to_path_buf(),
            hub: hub.clone(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("127.0.0.1:{}", addr.port()), hub)
    }

    fn write(dir: &std::path::Path, name: &str, body: Value) {
        std::fs::write(dir.join(name), body.to_string()).unwrap();
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn next_for_ticker<S>(ws: &mut S, ticker: &str) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = next_json(ws).await;
            if frame["ticker"] == ticker {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn daily_snapshot_lists_prediction_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "AAPL_prediction.json", json!({"ticker": "AAPL", "prediction": {"combined_score": 0.3}}));
        write(dir.path(), "MSFT_prediction.json", json!({"ticker": "MSFT"}));
        write(dir.path(), "AAPL_sentiment.json", json!({"ticker": "AAPL"}));
        write(dir.path(), "BROKEN_prediction.json", json!("x"));
        std::fs::write(dir.path().join("BAD_prediction.json"), "{ not json").unwrap();

        let (addr, _) = spawn_app(dir.path()).await;
        let body: Value = reqwest::get(format!("http://{addr}/predictions/daily"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let tickers: Vec<&str> = body["predictions"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["ticker"].as_str())
            .collect();
        assert_eq!(tickers, vec!["AAPL", "MSFT"]);
        assert_eq!(body["count"], body["predictions"].as_array().unwrap().len());
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn daily_snapshot_is_empty_for_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _) = spawn_app(&dir.path().join("nope")).await;
        let resp = reqwest::get(format!("http://{addr}/predictions/daily")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["predictions"], json!([]));
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn single_prediction_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "NVDA_prediction.json", json!({"ticker": "NVDA", "company_name": "NVIDIA"}));
        let (addr, _) = spawn_app(dir.path()).await;

        let found: Value = reqwest::get(format!("http://{addr}/api/prediction/nvda"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(found["company_name"], "NVIDIA");

        let missing = reqwest::get(format!("http://{addr}/api/prediction/TSLA")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = missing.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("TSLA"));
    }

    #[tokio::test]
    async fn websocket_greets_counts_and_scopes_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, hub) = spawn_app(dir.path()).await;

        let (mut all, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut scoped, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await.unwrap();
        assert_eq!(next_json(&mut all).await["type"], "connected");
        assert_eq!(next_json(&mut scoped).await["type"], "connected");

        scoped
            .send(WsMessage::Text(json!({"action": "subscribe", "ticker": "aapl"}).to_string()))
            .await
            .unwrap();

        let health: Value = reqwest::get(format!("http://{addr}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["websocket_clients"], 2);

        // The subscribe frame is applied asynchronously; retry until the
        // scoped peer stops receiving other tickers.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = ServerEvent::PredictionUpdated {
                    ticker: "ZZZZ".to_string(),
                    prediction: json!({}),
                };
                if hub.broadcast(&event) == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("subscription never applied");

        let event = event_for(WatchNotification::Changed {
            ticker: "AAPL".to_string(),
            aspect: ChangedAspect::Prediction,
            payload: json!({"ticker": "AAPL", "prediction": {"final_signal": "BUY"}}),
        });
        assert_eq!(hub.broadcast(&event), 2);
        let got = next_for_ticker(&mut scoped, "AAPL").await;
        assert_eq!(got["type"], "prediction_updated");
        assert_eq!(next_for_ticker(&mut all, "AAPL").await["type"], "prediction_updated");
        assert_eq!(got["ticker"], "AAPL");
        assert_eq!(got["prediction"]["prediction"]["final_signal"], "BUY");

        drop(all);
        drop(scoped);
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("peers not unregistered");
    }

    #[test]
    fn secondary_aspects_become_data_updates() {
        let event = event_for(WatchNotification::Changed {
            ticker: "AAPL".to_string(),
            aspect: ChangedAspect::Sentiment,
            payload: json!({"score": 0.1}),
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "data_updated");
        assert_eq!(wire["aspect"], "sentiment");

        let refresh = event_for(WatchNotification::FullSnapshot { predictions: vec![json!({"ticker": "A"})] });
        assert_eq!(serde_json::to_value(&refresh).unwrap()["type"], "predictions_refresh");
    }
}
