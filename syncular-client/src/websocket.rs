//! Realtime wake-up transport. Grounded on the teacher's `WebSocketClient`
//! (connect/send/receive over `tokio-tungstenite`, a `reconnect` method)
//! but carries `RealtimeClientMessage`/`RealtimeServerMessage` envelopes
//! instead of whole-document messages, and backs off between reconnect
//! attempts with `backoff` rather than retrying immediately.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use syncular_core::protocol::{RealtimeClientMessage, RealtimeServerMessage};
use syncular_core::SyncResult;

pub struct WebSocketClient {
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    server_url: String,
}

impl WebSocketClient {
    pub async fn connect(server_url: &str, token: &str) -> SyncResult<Self> {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(to_transport_error)?;
        let mut client = Self {
            ws_stream,
            server_url: server_url.to_string(),
        };
        client
            .send(RealtimeClientMessage::Auth { token: token.to_string() })
            .await?;
        Ok(client)
    }

    pub async fn send(&mut self, message: RealtimeClientMessage) -> SyncResult<()> {
        let json = serde_json::to_string(&message)?;
        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(to_transport_error)?;
        Ok(())
    }

    pub async fn receive(&mut self) -> SyncResult<Option<RealtimeServerMessage>> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(serde_json::from_str(&text)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(to_transport_error(e)),
            }
        }
    }

    pub async fn close(mut self) -> SyncResult<()> {
        self.ws_stream.close(None).await.map_err(to_transport_error)?;
        Ok(())
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn to_transport_error(e: tokio_tungstenite::tungstenite::Error) -> syncular_core::SyncError {
    syncular_core::errors::ClientError::Transport(e.to_string()).into()
}

/// Connect with exponential backoff, retrying until the first successful
/// handshake. Used by the sync engine's reconnect loop when the realtime
/// transport drops.
pub async fn connect_with_backoff(server_url: &str, token: &str) -> WebSocketClient {
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };
    loop {
        match WebSocketClient::connect(server_url, token).await {
            Ok(client) => return client,
            Err(err) => {
                let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "realtime reconnect failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
