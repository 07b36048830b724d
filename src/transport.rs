//! Wire transport seam.
//!
//! The connection manager talks to the service through a [`Transport`],
//! which turns connect parameters into a [`TransportLink`]: an outbound
//! frame sender and an inbound event receiver. Dropping the sender closes
//! the transport.
//!
//! [`WebSocketTransport`] is the production implementation: JSON text
//! frames over `tokio-tungstenite`, with a pump task bridging the socket
//! halves and the link channels. Tests substitute an in-process transport.

// Rust guideline compliant 2026-02

use std::fmt::Debug;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::error::{codes, Error, ErrorInfo, Result};
use crate::protocol::ProtocolMessage;

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Base endpoint URL (`ws://`, `wss://`, `http://` or `https://`).
    pub url: String,
    /// Query parameters: credentials, protocol version, resume key.
    pub query: Vec<(String, String)>,
}

impl ConnectParams {
    /// Value of a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Full WebSocket URL with the query string.
    pub fn to_url(&self) -> Result<String> {
        let base = http_to_ws_scheme(&self.url);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| Error::InvalidArgument(format!("invalid realtime URL {base}: {e}")))?;
        url.query_pairs_mut().extend_pairs(&self.query);
        Ok(url.into())
    }
}

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Decoded frame.
    Frame(ProtocolMessage),
    /// The transport is gone. No further events follow.
    Closed {
        /// Why, if known.
        reason: Option<ErrorInfo>,
    },
}

/// An open transport.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound frames. Dropping it closes the transport.
    pub sender: mpsc::UnboundedSender<ProtocolMessage>,
    /// Inbound events.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to the service.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Open a transport. Must not wait for the service's CONNECTED frame.
    async fn connect(&self, params: &ConnectParams) -> Result<TransportLink>;
}

/// JSON-over-WebSocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<TransportLink> {
        let url = params.to_url()?;
        let (writer, reader) = ws_connect(&url).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(writer, reader, out_rx, event_tx));

        Ok(TransportLink {
            sender: out_tx,
            events: event_rx,
        })
    }
}

/// Bridge socket halves and link channels until either side closes.
async fn pump(
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    log::debug!("[Transport] Link dropped, closing socket");
                    let _ = writer.send_close().await;
                    return;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("[Transport] Failed to serialise {:?} frame: {}", frame.action, e);
                        continue;
                    }
                };
                log::trace!("[Transport] >> {}", text);
                if let Err(e) = writer.send_text(text).await {
                    break Some(transport_error(format!("send failed: {e}")));
                }
            }
            msg = reader.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    log::trace!("[Transport] << {}", text);
                    match serde_json::from_str::<ProtocolMessage>(&text) {
                        Ok(frame) => {
                            if events.send(TransportEvent::Frame(frame)).is_err() {
                                let _ = writer.send_close().await;
                                return;
                            }
                        }
                        Err(e) => log::warn!("[Transport] Dropping unparseable frame: {}", e),
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        break Some(transport_error(format!("pong failed: {e}")));
                    }
                }
                Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::info!("[Transport] Socket closed by peer: {} {}", code, reason);
                    break Some(transport_error(format!("socket closed ({code}) {reason}")));
                }
                Some(Err(e)) => break Some(transport_error(e.to_string())),
                None => break None,
            }
        }
    };

    let _ = events.send(TransportEvent::Closed { reason });
}

fn transport_error(message: String) -> ErrorInfo {
    ErrorInfo::new(codes::DISCONNECTED, Some(400), message)
}

/// Received WebSocket message.
#[derive(Debug)]
enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send_text failed: {e}")))
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send_pong failed: {e}")))
    }

    async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send_close failed: {e}")))
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next message, `None` when the stream ends. Raw frames are skipped.
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => WsMessage::Text(text.to_string()),
                Ok(tungstenite::Message::Binary(data)) => WsMessage::Binary(data.to_vec()),
                Ok(tungstenite::Message::Ping(data)) => WsMessage::Ping(data.to_vec()),
                Ok(tungstenite::Message::Pong(data)) => WsMessage::Pong(data.to_vec()),
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(e) => {
                    return Some(Err(Error::Transport(format!("WebSocket read error: {e}"))))
                }
            };
            return Some(Ok(msg));
        }
    }
}

async fn ws_connect(url: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .map_err(|e| Error::InvalidArgument(format!("invalid WebSocket URL {url}: {e}")))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::Transport(format!("WebSocket connect failed: {e}")))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme. WS URLs pass through.
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}
