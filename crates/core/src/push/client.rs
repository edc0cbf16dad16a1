use crate::push::protocol::{decode_inbound, ClientCommand, InboundEvent};
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    Dial,
    Opened,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn next(self, input: ConnectionInput) -> Self {
        use ConnectionInput::*;
        match (self, input) {
            (Self::Disconnected, Dial) => Self::Connecting,
            (Self::Connecting, Opened) => Self::Open,
            (Self::Connecting | Self::Open, Failed | Closed) => Self::Disconnected,
            (state, _) => state,
        }
    }
}

/// Everything the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    State(ConnectionState),
    Inbound(InboundEvent),
    Error(String),
}

enum StreamEnd {
    Cancelled,
    Closed,
    OwnerGone,
}

#[derive(Debug, Clone)]
pub struct PushClient {
    url: String,
    reconnect_delay: Duration,
    subscriptions: Vec<String>,
}

impl PushClient {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            subscriptions: Vec::new(),
        }
    }

    /// Tickers to send `subscribe` for after every (re)connect.
    pub fn with_subscriptions(mut self, tickers: impl IntoIterator<Item = String>) -> Self {
        self.subscriptions = tickers.into_iter().collect();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs until `cancel` fires or `events` is dropped. Cancellation closes
    /// the socket and abandons any pending reconnect wait.
    pub async fn run(self, events: mpsc::Sender<ChannelEvent>, cancel: CancellationToken) {
        let mut state = ConnectionState::Disconnected;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !self.step(&mut state, ConnectionInput::Dial, &events).await {
                return;
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                res = connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((stream, _response)) => {
                    tracing::info!(url = %self.url, "push channel open");
                    if !self.step(&mut state, ConnectionInput::Opened, &events).await {
                        return;
                    }
                    match self.pump(stream, &events, &cancel).await {
                        Ok(StreamEnd::Cancelled) => break,
                        Ok(StreamEnd::OwnerGone) => return,
                        Ok(StreamEnd::Closed) => {
                            tracing::info!(url = %self.url, "push channel closed by server");
                            if !self.step(&mut state, ConnectionInput::Closed, &events).await {
                                return;
                            }
                        }
                        Err(err) => {
                            if !self.fail(&mut state, format!("{err:#}"), &events).await {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    if !self.fail(&mut state, format!("push connect failed: {err}"), &events).await {
                        return;
                    }
                }
            }

            tracing::debug!(delay = ?self.reconnect_delay, "scheduling push reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        if state != ConnectionState::Disconnected {
            let _ = events.try_send(ChannelEvent::State(ConnectionState::Disconnected));
        }
        tracing::debug!(url = %self.url, "push client stopped");
    }

    async fn step(
        &self,
        state: &mut ConnectionState,
        input: ConnectionInput,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> bool {
        let next = state.next(input);
        if next == *state {
            return true;
        }
        *state = next;
        events.send(ChannelEvent::State(next)).await.is_ok()
    }

    async fn fail(
        &self,
        state: &mut ConnectionState,
        message: String,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> bool {
        tracing::warn!(url = %self.url, error = %message, "push channel failure");
        if events.send(ChannelEvent::Error(message)).await.is_err() {
            return false;
        }
        self.step(state, ConnectionInput::Failed, events).await
    }

    async fn pump<S>(
        &self,
        stream: S,
        events: &mpsc::Sender<ChannelEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StreamEnd>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = stream.split();

        for ticker in &self.subscriptions {
            let cmd = serde_json::to_string(&ClientCommand::Subscribe {
                ticker: ticker.clone(),
            })?;
            write
                .send(Message::Text(cmd))
                .await
                .context("send subscribe failed")?;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamEnd::Cancelled);
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(StreamEnd::Closed);
                    };
                    match msg.context("push channel read failed")? {
                        Message::Text(text) => match decode_inbound(&text) {
                            Ok(event) => {
                                if events.send(ChannelEvent::Inbound(event)).await.is_err() {
                                    return Ok(StreamEnd::OwnerGone);
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %format!("{err:#}"), "ignoring malformed push message");
                            }
                        },
                        Message::Ping(payload) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Message::Close(frame) => {
                            tracing::debug!(?frame, "push channel close frame");
                            return Ok(StreamEnd::Closed);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn state_machine_transitions() {
        use ConnectionInput::*;
        use ConnectionState::*;
        assert_eq!(Disconnected.next(Dial), Connecting);
        assert_eq!(Connecting.next(Opened), Open);
        assert_eq!(Connecting.next(Failed), Disconnected);
        assert_eq!(Open.next(Closed), Disconnected);
        assert_eq!(Open.next(Failed), Disconnected);
        // Inputs that make no sense in a state leave it unchanged.
        assert_eq!(Open.next(Dial), Open);
        assert_eq!(Disconnected.next(Opened), Disconnected);
    }

    async fn recv(rx: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn delivers_events_and_reconnects_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (first_frames_tx, mut first_frames) = mpsc::channel::<String>(4);
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => first_frames_tx.send(text).await.unwrap(),
                    other => panic!("expected a subscribe frame first, got {other:?}"),
                }
                ws.send(Message::Text("{broken".to_string())).await.unwrap();
                ws.send(Message::Text(json!({"type": "mystery"}).to_string())).await.unwrap();
                ws.send(Message::Text(
                    json!({"type": "prediction_updated", "ticker": "AAPL", "prediction": {"final_signal": "BUY"}}).to_string(),
                ))
                .await
                .unwrap();
                ws.close(None).await.unwrap();
            }
        });

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let client = PushClient::new(format!("ws://{addr}"), Duration::from_millis(50))
            .with_subscriptions(["AAPL".to_string()]);
        let task = tokio::spawn(client.run(tx, cancel.clone()));

        for _ in 0..2 {
            assert_eq!(recv(&mut rx).await, ChannelEvent::State(ConnectionState::Connecting));
            assert_eq!(recv(&mut rx).await, ChannelEvent::State(ConnectionState::Open));
            assert_eq!(
                recv(&mut rx).await,
                ChannelEvent::Inbound(InboundEvent::Unknown {
                    kind: "mystery".to_string()
                })
            );
            assert!(matches!(
                recv(&mut rx).await,
                ChannelEvent::Inbound(InboundEvent::PredictionUpdated { ref ticker, .. }) if ticker == "AAPL"
            ));
            assert_eq!(recv(&mut rx).await, ChannelEvent::State(ConnectionState::Disconnected));
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        server.await.unwrap();

        // One subscribe per connection, so interest survives reconnects.
        for _ in 0..2 {
            let frame: serde_json::Value = serde_json::from_str(&first_frames.recv().await.unwrap()).unwrap();
            assert_eq!(frame, json!({"action": "subscribe", "ticker": "AAPL"}));
        }
    }

    #[tokio::test]
    async fn cancel_during_reconnect_wait_stops_promptly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let client = PushClient::new(format!("ws://{addr}"), Duration::from_secs(3600));
        let task = tokio::spawn(client.run(tx, cancel.clone()));

        assert_eq!(recv(&mut rx).await, ChannelEvent::State(ConnectionState::Connecting));
        assert!(matches!(recv(&mut rx).await, ChannelEvent::Error(_)));
        assert_eq!(recv(&mut rx).await, ChannelEvent::State(ConnectionState::Disconnected));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
