//! Session-to-connection routing.
//!
//! The router is owned by the hub task and mutated only there, so it holds
//! plain maps without locks.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MessageEnvelope;

/// Identifier of one browser session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a browser connection's outbound queue.
pub type ConnectionTx = mpsc::Sender<MessageEnvelope>;

/// Why an envelope could not be delivered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingMiss {
    /// No session with this id is bound.
    #[error("session {0} is not bound")]
    UnknownSession(SessionId),
    /// The session belongs to a different analysis than the envelope target.
    #[error("session {session} belongs to '{bound}', not '{target}'")]
    AnalysisMismatch {
        /// Session addressed by the envelope.
        session: SessionId,
        /// Analysis the session is bound to.
        bound: String,
        /// Analysis named by the envelope.
        target: String,
    },
    /// The browser connection is gone but not yet unbound.
    #[error("connection for session {0} is closed")]
    ConnectionClosed(SessionId),
    /// The browser connection's queue is full.
    #[error("connection for session {0} is not keeping up")]
    Backpressure(SessionId),
}

struct SessionEntry {
    analysis: String,
    connection: ConnectionTx,
}

/// Maps session ids to their analysis and browser connection.
#[derive(Default)]
pub struct SessionRouter {
    sessions: HashMap<SessionId, SessionEntry>,
}

impl SessionRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `session` to `analysis`. Rebinding an existing session replaces
    /// the previous binding and returns its analysis name.
    pub fn bind(
        &mut self,
        session: SessionId,
        analysis: impl Into<String>,
        connection: ConnectionTx,
    ) -> Option<String> {
        let analysis = analysis.into();
        debug!(%session, %analysis, "session bound");
        self.sessions
            .insert(
                session,
                SessionEntry {
                    analysis,
                    connection,
                },
            )
            .map(|previous| previous.analysis)
    }

    /// Removes `session` and returns the analysis it was bound to.
    pub fn unbind(&mut self, session: &SessionId) -> Option<String> {
        let removed = self.sessions.remove(session).map(|entry| entry.analysis);
        if removed.is_some() {
            debug!(%session, "session unbound");
        }
        removed
    }

    /// Analysis `session` is bound to, if any.
    #[must_use]
    pub fn analysis_of(&self, session: &SessionId) -> Option<&str> {
        self.sessions.get(session).map(|entry| entry.analysis.as_str())
    }

    /// Number of bound sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions currently bound to `analysis`.
    #[must_use]
    pub fn sessions_for(&self, analysis: &str) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.analysis == analysis)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Delivers `envelope` to the connection bound to its session.
    ///
    /// Misses are logged and returned; they are never fatal.
    ///
    /// # Errors
    ///
    /// Returns a `RoutingMiss` if the session is unknown, bound to another
    /// analysis, or its connection cannot take the envelope.
    pub fn route(&self, envelope: MessageEnvelope) -> Result<(), RoutingMiss> {
        let result = self.try_route(envelope);
        if let Err(miss) = &result {
            warn!(error = %miss, "routing miss, envelope dropped");
            metrics::counter!("dashbench_routing_miss_total").increment(1);
        }
        result
    }

    fn try_route(&self, envelope: MessageEnvelope) -> Result<(), RoutingMiss> {
        let session = envelope.session.clone();
        let Some(entry) = self.sessions.get(&session) else {
            return Err(RoutingMiss::UnknownSession(session));
        };
        if entry.analysis != envelope.target {
            return Err(RoutingMiss::AnalysisMismatch {
                session,
                bound: entry.analysis.clone(),
                target: envelope.target,
            });
        }
        entry.connection.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RoutingMiss::Backpressure(session),
            mpsc::error::TrySendError::Closed(_) => RoutingMiss::ConnectionClosed(session),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(target: &str, session: &str) -> MessageEnvelope {
        MessageEnvelope::new(target, SessionId::from(session), "run", json!({"x": 1}))
    }

    #[test]
    fn routes_to_bound_connection_unchanged() {
        let mut router = SessionRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.bind(SessionId::from("s1"), "demo", tx);

        router.route(envelope("demo", "s1")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), envelope("demo", "s1"));
    }

    #[test]
    fn unbound_session_is_a_miss() {
        let mut router = SessionRouter::new();
        let (tx, _rx) = mpsc::channel(4);
        router.bind(SessionId::from("s1"), "demo", tx);
        router.unbind(&SessionId::from("s1"));

        assert_eq!(
            router.route(envelope("demo", "s1")),
            Err(RoutingMiss::UnknownSession(SessionId::from("s1")))
        );
    }

    #[test]
    fn other_analysis_cannot_reach_session() {
        let mut router = SessionRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.bind(SessionId::from("s1"), "demo", tx);

        assert!(matches!(
            router.route(envelope("other", "s1")),
            Err(RoutingMiss::AnalysisMismatch { .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_connection_drops_envelope() {
        let mut router = SessionRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        router.bind(SessionId::from("s1"), "demo", tx);

        router.route(envelope("demo", "s1")).unwrap();
        assert_eq!(
            router.route(envelope("demo", "s1")),
            Err(RoutingMiss::Backpressure(SessionId::from("s1")))
        );
    }

    #[test]
    fn sessions_are_grouped_by_analysis() {
        let mut router = SessionRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        router.bind(SessionId::from("s1"), "demo", tx.clone());
        router.bind(SessionId::from("s2"), "demo", tx.clone());
        router.bind(SessionId::from("s3"), "other", tx);

        assert_eq!(router.len(), 3);
        assert_eq!(router.sessions_for("demo").len(), 2);
        assert_eq!(router.analysis_of(&SessionId::from("s3")), Some("other"));
    }
}
