//! WebSocket transport over tokio-tungstenite

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use nametag_core::TransportError;
use nametag_harness::{Connector, RelayLink};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;

/// Production connector speaking `ws://` and `wss://`
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<RelayLink, TransportError> {
        let (socket, response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        // A close frame ends the stream; binary and control frames are skipped
        let stream = stream
            .take_while(|message| future::ready(!matches!(message, Ok(Message::Close(_)))))
            .filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        trace!("Ignoring {} byte binary frame", bytes.len());
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::ReceiveFailed {
                        reason: e.to_string(),
                    })),
                })
            });

        Ok(RelayLink::new(Box::pin(sink), Box::pin(stream)))
    }
}
