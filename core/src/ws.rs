//! Production `ControlChannel`: a `tokio-tungstenite` WebSocket wrapping
//! the cloud control connection. Registration (`{connectionId, wsUrl}`)
//! and the reconnect/backoff loop live in the Listener Runtime; this
//! module only knows how to open a socket with the right URL/headers and
//! move JSON frames across it.

use async_trait::async_trait;
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::conversation::ControlChannel;
use crate::error::ListenerError;
use crate::error::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Append `deviceId` and `connectionName` query parameters to a `wsUrl`
/// returned by registration, per spec.md §6.
pub fn build_socket_url(ws_url: &str, device_id: &str, connection_name: &str) -> std::result::Result<String, url::ParseError> {
    let mut url = Url::parse(ws_url)?;
    url.query_pairs_mut()
        .append_pair("deviceId", device_id)
        .append_pair("connectionName", connection_name);
    Ok(url.into())
}

/// Open the control-channel WebSocket and authenticate with
/// `Authorization: Bearer <api-key>`. Intended as the `connect` closure
/// passed to `ListenerRuntime::run`.
pub async fn connect(ws_url: &str, device_id: &str, connection_name: &str, api_key: &str) -> std::result::Result<Box<dyn ControlChannel>, String> {
    let socket_url = build_socket_url(ws_url, device_id, connection_name).map_err(|e| e.to_string())?;

    let mut request = socket_url.into_client_request().map_err(|e| e.to_string())?;
    let header_value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| e.to_string())?;
    request.headers_mut().insert(AUTHORIZATION, header_value);

    let (stream, _response) = connect_async(request).await.map_err(|e| e.to_string())?;
    let (write, read) = stream.split();

    Ok(Box::new(WebSocketControlChannel {
        write: Mutex::new(write),
        read: Mutex::new(read),
    }))
}

struct WebSocketControlChannel {
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl ControlChannel for WebSocketControlChannel {
    async fn send(&self, frame: Value) -> Result<()> {
        let text = serde_json::to_string(&frame)?;
        self.write
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ListenerError::Socket(e.to_string()))
    }

    async fn recv(&self) -> Option<std::result::Result<Value, String>> {
        loop {
            let msg = self.read.lock().await.next().await?;
            match msg {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).map_err(|e| e.to_string())),
                Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                    return Some(Err(format!("closed with code {code}")));
                }
                Err(e) => return Some(Err(e.to_string())),
            }
        }
    }

    async fn close(&self) {
        let _ = self.write.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn socket_url_carries_device_and_connection_name() {
        let url = build_socket_url("wss://cloud.example/ws", "device-1", "laptop").unwrap();
        assert!(url.starts_with("wss://cloud.example/ws?"));
        assert!(url.contains("deviceId=device-1"));
        assert!(url.contains("connectionName=laptop"));
    }

    #[test]
    fn socket_url_appends_to_existing_query() {
        let url = build_socket_url("wss://cloud.example/ws?token=abc", "d", "c").unwrap();
        assert!(url.contains("token=abc"));
        assert!(url.contains("deviceId=d"));
    }
}
