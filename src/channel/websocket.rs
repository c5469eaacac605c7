//! WebSocket transport for the event channel

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use url::Url;

use super::transport::{ChannelError, Transport};
use crate::auth::Credential;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WebSocketTransport {
    url: Url,
    stream: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self { url, stream: None }
    }

    fn stream(&mut self) -> Result<&mut WsStream, ChannelError> {
        self.stream.as_mut().ok_or(ChannelError::NotConnected)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    /// Open the socket, authenticating with a bearer header.
    async fn connect(&mut self, credential: &Credential) -> Result<(), ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token))
            .map_err(|_| ChannelError::Unauthenticated("token is not a valid header".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        tracing::info!("Connecting WebSocket to {}", self.url);

        let (stream, response) = connect_async(request).await.map_err(classify)?;

        tracing::info!("WebSocket connected (status={})", response.status());
        self.stream = Some(stream);
        Ok(())
    }

    /// Next text frame. Pings are answered, other control frames skipped.
    async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        let stream = self.stream()?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    stream.send(Message::Pong(data)).await.map_err(classify)?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => return Err(classify(e)),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        tracing::debug!("WS send: {}", frame);
        self.stream()?
            .send(Message::Text(frame))
            .await
            .map_err(classify)
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                tracing::debug!("WebSocket close failed: {}", e);
            }
        }
    }
}

/// Map handshake rejections to `Unauthenticated`, everything else to
/// a retryable transport error.
fn classify(err: tungstenite::Error) -> ChannelError {
    match err {
        tungstenite::Error::Http(ref response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            ChannelError::Unauthenticated(format!("handshake returned {}", response.status()))
        }
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ChannelError::Closed
        }
        other => ChannelError::Transport(other.to_string()),
    }
}
