//! Browser connection lifecycle.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::bus::MessageEnvelope;
use crate::hub::HubHandle;
use crate::router::SessionId;
use crate::ws::types::{ClientMessage, ServerFrame, WsError};

const PING_INTERVAL: Duration = Duration::from_secs(15);
pub(crate) const OUTBOUND_CAPACITY: usize = 256;

/// A browser socket opened on one analysis.
pub struct Connection {
    analysis: String,
    stream: WebSocket,
    hub: HubHandle,
    session: Option<SessionId>,
    outbound_tx: mpsc::Sender<MessageEnvelope>,
    outbound_rx: mpsc::Receiver<MessageEnvelope>,
}

impl Connection {
    /// Wraps an upgraded socket. No session exists until the browser sends
    /// its `__connect` frame.
    pub fn new(stream: WebSocket, analysis: impl Into<String>, hub: HubHandle) -> Self {
        let analysis = analysis.into();
        info!(%analysis, "WebSocket connection established");
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            analysis,
            stream,
            hub,
            session: None,
            outbound_tx,
            outbound_rx,
        }
    }

    /// Runs the connection until the browser leaves or the hub stops.
    ///
    /// The session, if one was established, is always disconnected from the
    /// hub on the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if WebSocket communication fails.
    pub async fn run(mut self) -> Result<(), WsError> {
        let result = self.event_loop().await;
        if let Some(session) = self.session.take() {
            if let Err(e) = self.hub.disconnect(session).await {
                debug!(analysis = %self.analysis, error = %e, "disconnect not delivered");
            }
        }
        match result {
            Ok(()) => self.graceful_close().await,
            Err(e) => Err(e),
        }
    }

    async fn event_loop(&mut self) -> Result<(), WsError> {
        let mut ping_interval = interval(PING_INTERVAL);

        loop {
            tokio::select! {
                incoming = self.stream.next() => {
                    match incoming {
                        Some(Ok(msg)) => {
                            if self.handle_incoming_message(msg).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            error!(analysis = %self.analysis, error = %e, "WebSocket error");
                            return Err(WsError::AxumWs(e));
                        }
                        None => {
                            debug!(analysis = %self.analysis, "Stream ended");
                            return Ok(());
                        }
                    }
                }

                Some(envelope) = self.outbound_rx.recv() => {
                    self.send_envelope(&envelope).await?;
                }

                _ = ping_interval.tick() => {
                    self.send_ping().await?;
                }
            }
        }
    }

    async fn handle_incoming_message(&mut self, message: Message) -> Result<bool, WsError> {
        match message {
            Message::Text(text) => {
                debug!(analysis = %self.analysis, len = text.len(), "Received text");
                match ClientMessage::parse(text.as_str()) {
                    Ok(msg) => self.handle_client_message(msg).await,
                    Err(e) => {
                        warn!(analysis = %self.analysis, error = %e, "Malformed frame ignored");
                        Ok(false)
                    }
                }
            }
            Message::Binary(data) => {
                warn!(analysis = %self.analysis, len = data.len(), "Unexpected binary from client");
                Ok(false)
            }
            Message::Ping(data) => {
                self.stream
                    .send(Message::Pong(data))
                    .await
                    .map_err(WsError::AxumWs)?;
                Ok(false)
            }
            Message::Pong(_) => Ok(false),
            Message::Close(_) => {
                info!(analysis = %self.analysis, "Client initiated close");
                Ok(true)
            }
        }
    }

    async fn handle_client_message(&mut self, message: ClientMessage) -> Result<bool, WsError> {
        match (message, self.session.clone()) {
            (ClientMessage::Connect { .. }, Some(session)) => {
                warn!(analysis = %self.analysis, %session, "Repeated __connect ignored");
                Ok(false)
            }
            (
                ClientMessage::Connect {
                    requested,
                    request_args,
                },
                None,
            ) => {
                let connected = self
                    .hub
                    .connect(
                        self.analysis.clone(),
                        requested,
                        request_args,
                        self.outbound_tx.clone(),
                    )
                    .await;
                match connected {
                    Ok(session) => {
                        self.session = Some(session);
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(analysis = %self.analysis, error = %e, "Session refused");
                        let frame = json!({"signal": "__error", "load": {"reason": e.to_string()}});
                        self.stream
                            .send(Message::Text(frame.to_string().into()))
                            .await
                            .map_err(WsError::AxumWs)?;
                        Ok(true)
                    }
                }
            }
            (ClientMessage::Signal { signal, .. }, None) => {
                warn!(analysis = %self.analysis, %signal, "Signal before __connect ignored");
                Ok(false)
            }
            (ClientMessage::Signal { signal, load }, Some(session)) => {
                self.hub.event(session, signal, load).await?;
                Ok(false)
            }
        }
    }

    async fn send_envelope(&mut self, envelope: &MessageEnvelope) -> Result<(), WsError> {
        let text = ServerFrame::from_envelope(envelope).to_text()?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(WsError::AxumWs)
    }

    async fn send_ping(&mut self) -> Result<(), WsError> {
        debug!(analysis = %self.analysis, "Sending ping");
        self.stream
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(WsError::AxumWs)
    }

    async fn graceful_close(mut self) -> Result<(), WsError> {
        debug!(analysis = %self.analysis, "Closing gracefully");
        // The peer may already be gone.
        let _ = self.stream.send(Message::Close(None)).await;
        info!(analysis = %self.analysis, "Connection closed");
        Ok(())
    }
}
