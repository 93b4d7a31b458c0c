//! WebSocket session with the OpenAI Realtime API
//!
//! `connect()` performs one attempt: handshake, wait for `session.created`,
//! send the session config, wait for `session.updated`. Reconnecting is the
//! caller's decision.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage, SessionConfig};
use super::StreamingError;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for each handshake step (`session.created`, `session.updated`)
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Server messages buffered ahead of the consumer
const INCOMING_CAPACITY: usize = 100;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct RealtimeSession {
    write: WsSink,
    incoming_rx: Option<mpsc::Receiver<ServerMessage>>,
    session_id: String,
    receiver_task: tokio::task::JoinHandle<()>,
}

impl RealtimeSession {
    pub async fn connect(
        url: &str,
        api_key: &str,
        config: SessionConfig,
    ) -> Result<Self, StreamingError> {
        if api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }

        let mut request = url
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("Connecting to Realtime API...");

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let (write, mut read) = ws_stream.split();

        let session_id = timeout(SESSION_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                match decode(frame) {
                    Inbound::Message(ServerMessage::SessionCreated { session }) => {
                        return Ok(session.id)
                    }
                    Inbound::Message(ServerMessage::Error { error }) if error.is_auth() => {
                        return Err(StreamingError::AuthenticationFailed(error.message));
                    }
                    Inbound::Message(ServerMessage::Error { error }) => {
                        return Err(StreamingError::ProtocolError(error.message));
                    }
                    Inbound::Closed(reason) => {
                        return Err(StreamingError::Disconnected(format!(
                            "before session.created: {}",
                            reason
                        )));
                    }
                    Inbound::Message(_) | Inbound::Skip => {}
                }
            }
            Err(StreamingError::Disconnected("stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("session.created timeout".to_string()))??;

        log::info!("Realtime session created: {}", session_id);

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let receiver_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match decode(frame) {
                    Inbound::Message(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Inbound::Closed(reason) => {
                        log::info!("Realtime: connection closed ({})", reason);
                        break;
                    }
                    Inbound::Skip => {}
                }
            }
            log::debug!("Realtime receiver task exiting");
        });

        let mut session = Self {
            write,
            incoming_rx: Some(incoming_rx),
            session_id,
            receiver_task,
        };
        session.configure(config).await?;
        Ok(session)
    }

    async fn configure(&mut self, config: SessionConfig) -> Result<(), StreamingError> {
        self.send_message(&ClientMessage::session_update(config))
            .await?;

        let incoming_rx = self.incoming_rx.as_mut().ok_or_else(|| {
            StreamingError::ProtocolError("incoming receiver already taken".to_string())
        })?;

        let deadline = tokio::time::Instant::now() + SESSION_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, incoming_rx.recv()).await {
                Ok(Some(ServerMessage::SessionUpdated { session })) => {
                    log::info!("Realtime session configured (model={})", session.model);
                    return Ok(());
                }
                Ok(Some(ServerMessage::Error { error })) => {
                    return Err(StreamingError::ProtocolError(error.message));
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(StreamingError::Disconnected(
                        "closed during configuration".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(StreamingError::ConnectionFailed(
                        "session.updated timeout".to_string(),
                    ));
                }
            }
        }
    }

    async fn send_message(&mut self, msg: &ClientMessage) -> Result<(), StreamingError> {
        let json =
            serde_json::to_string(msg).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
        self.write
            .send(Message::Text(json))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))
    }

    /// Append PCM16 mono samples at 24 kHz.
    pub async fn send_audio(&mut self, samples: &[i16]) -> Result<(), StreamingError> {
        self.send_message(&ClientMessage::audio_append(samples))
            .await
    }

    /// Take the incoming message stream so it can be read on another task.
    pub fn take_incoming_receiver(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.incoming_rx.take()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn disconnect(mut self) {
        log::info!("Disconnecting Realtime session {}", self.session_id);
        self.receiver_task.abort();
        if let Err(e) = self.write.close().await {
            log::warn!("Error closing WebSocket: {}", e);
        }
    }
}

/// One WebSocket frame, reduced to what the session cares about.
enum Inbound {
    Message(ServerMessage),
    Closed(String),
    Skip,
}

fn decode(frame: Result<Message, WsError>) -> Inbound {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => Inbound::Message(msg),
            Err(e) => {
                log::warn!("Realtime: unparseable server message: {}", e);
                Inbound::Skip
            }
        },
        Ok(Message::Close(frame)) => Inbound::Closed(
            frame
                .map(|f| format!("{} {}", f.code, f.reason))
                .unwrap_or_else(|| "no close frame".to_string()),
        ),
        Ok(_) => Inbound::Skip,
        Err(e) => Inbound::Closed(e.to_string()),
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.receiver_task.abort();
    }
}

pub fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}
