//! Browser socket message types.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bus::MessageEnvelope;
use crate::hub::HubError;
use crate::router::SessionId;

const CONNECT_KEY: &str = "__connect";
const REQUEST_ARGS_KEY: &str = "__request_args";

/// Message received from a browser.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Session handshake, sent once per connection.
    Connect {
        /// Session id to resume. Numeric ids are accepted as strings.
        requested: Option<SessionId>,
        /// Raw query string of the page, e.g. `?a=1`.
        request_args: Option<String>,
    },
    /// A signal for the analysis.
    Signal {
        /// Signal name.
        signal: String,
        /// Signal payload; `null` when absent.
        load: Value,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object or carries neither
    /// a handshake nor a signal.
    pub fn parse(text: &str) -> Result<Self, WsError> {
        let mut object: Map<String, Value> =
            serde_json::from_str(text).map_err(WsError::Serialization)?;

        if let Some(id) = object.remove(CONNECT_KEY) {
            let requested = match id {
                Value::String(s) if !s.is_empty() => Some(SessionId::from(s)),
                Value::Number(n) => Some(SessionId::from(n.to_string())),
                _ => None,
            };
            let request_args = match object.remove(REQUEST_ARGS_KEY) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            };
            return Ok(Self::Connect {
                requested,
                request_args,
            });
        }

        let signal = match object.remove("signal") {
            Some(Value::String(s)) => s,
            _ => return Err(WsError::MissingSignal),
        };
        let load = object.remove("load").unwrap_or(Value::Null);
        Ok(Self::Signal { signal, load })
    }
}

/// Frame sent to a browser.
#[derive(Debug, Serialize)]
pub struct ServerFrame<'a> {
    /// Signal name.
    pub signal: &'a str,
    /// Signal payload.
    pub load: &'a Value,
}

impl<'a> ServerFrame<'a> {
    /// Frame carrying `envelope`'s signal and payload.
    #[must_use]
    pub fn from_envelope(envelope: &'a MessageEnvelope) -> Self {
        Self {
            signal: &envelope.signal,
            load: &envelope.payload,
        }
    }

    /// Serializes the frame to JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_text(&self) -> Result<String, WsError> {
        serde_json::to_string(self).map_err(WsError::Serialization)
    }
}

/// Errors raised on a browser connection.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("WebSocket connection error: {0}")]
    AxumWs(#[from] axum::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("frame has neither '__connect' nor 'signal'")]
    MissingSignal,

    #[error(transparent)]
    Hub(#[from] HubError),
}
