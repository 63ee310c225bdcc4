//! Envelope types and the line-oriented wire frame.
//!
//! Every frame is a single line: `<topic> <json>\n`. Data frames carry the
//! target analysis name as topic so that subscribers filter on the topic
//! alone; control frames use [`CONTROL_TOPIC`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::router::SessionId;

/// Reserved topic for handshake and shutdown frames.
pub const CONTROL_TOPIC: &str = "__ctl";

/// Addressed unit of bus traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Analysis the envelope is addressed to.
    pub target: String,
    /// Browser session the event originates from or is destined for.
    pub session: SessionId,
    /// Logical event name.
    pub signal: String,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: Value,
}

impl MessageEnvelope {
    /// Creates an envelope.
    pub fn new(
        target: impl Into<String>,
        session: SessionId,
        signal: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            target: target.into(),
            session,
            signal: signal.into(),
            payload,
        }
    }
}

/// Bus control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent by a kernel right after connecting.
    Subscribe {
        /// Analysis name whose envelopes the connection wants.
        filter: String,
    },
    /// Handshake acknowledgement from the bus.
    Ready,
    /// The host is going away; kernels should exit.
    Shutdown,
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Envelope addressed to an analysis.
    Data(MessageEnvelope),
    /// Handshake or lifecycle frame.
    Control(ControlFrame),
}

/// Errors produced when encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum MalformedEnvelope {
    /// The line has no `<topic> <body>` separator.
    #[error("frame has no topic separator")]
    MissingTopic,
    /// The topic is empty, reserved, or contains whitespace.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
    /// The topic prefix disagrees with the envelope target.
    #[error("topic '{topic}' does not match envelope target '{target}'")]
    TopicMismatch {
        /// Topic found on the wire.
        topic: String,
        /// Target found in the body.
        target: String,
    },
    /// The body is not valid JSON for the frame kind.
    #[error("undecodable frame body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns true if `topic` can be used as an analysis topic on the wire.
#[must_use]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic != CONTROL_TOPIC && !topic.chars().any(char::is_whitespace)
}

impl Frame {
    /// Returns the topic this frame is published under.
    #[must_use]
    pub fn topic(&self) -> &str {
        match self {
            Self::Data(envelope) => &envelope.target,
            Self::Control(_) => CONTROL_TOPIC,
        }
    }

    /// Returns true if a subscriber filtering on `filter` should receive it.
    ///
    /// Control frames reach every subscriber.
    #[must_use]
    pub fn matches(&self, filter: &str) -> bool {
        match self {
            Self::Data(envelope) => envelope.target == filter,
            Self::Control(_) => true,
        }
    }

    /// Encodes the frame as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope::InvalidTopic` if a data frame targets a name
    /// that cannot be used as a topic.
    pub fn encode(&self) -> Result<String, MalformedEnvelope> {
        let body = match self {
            Self::Data(envelope) => {
                if !is_valid_topic(&envelope.target) {
                    return Err(MalformedEnvelope::InvalidTopic(envelope.target.clone()));
                }
                serde_json::to_string(envelope)?
            }
            Self::Control(control) => serde_json::to_string(control)?,
        };
        Ok(format!("{} {body}\n", self.topic()))
    }

    /// Decodes one line (with or without its trailing newline).
    ///
    /// # Errors
    ///
    /// Returns a `MalformedEnvelope` variant describing why the line was rejected.
    pub fn decode(line: &str) -> Result<Self, MalformedEnvelope> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (topic, body) = line
            .split_once(' ')
            .ok_or(MalformedEnvelope::MissingTopic)?;

        if topic == CONTROL_TOPIC {
            return Ok(Self::Control(serde_json::from_str(body)?));
        }
        if !is_valid_topic(topic) {
            return Err(MalformedEnvelope::InvalidTopic(topic.to_string()));
        }

        let envelope: MessageEnvelope = serde_json::from_str(body)?;
        if envelope.target != topic {
            return Err(MalformedEnvelope::TopicMismatch {
                topic: topic.to_string(),
                target: envelope.target,
            });
        }
        Ok(Self::Data(envelope))
    }
}
