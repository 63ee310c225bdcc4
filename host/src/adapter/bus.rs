//! Adapter that forwards events to an external kernel over the bus.

use serde_json::Value;
use tracing::{debug, warn};

use super::{AdapterKind, AnalysisAdapter, ConnectArgs};
use crate::bus::{BusPublisher, MessageEnvelope};
use crate::router::SessionId;

/// Publishes browser events as envelopes and relays kernel replies.
///
/// One kernel process serves every session of the analysis; the session id
/// on each envelope keeps their traffic apart.
pub struct BusAdapter {
    name: String,
    publisher: BusPublisher,
}

impl BusAdapter {
    /// Creates an adapter publishing for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, publisher: BusPublisher) -> Self {
        Self {
            name: name.into(),
            publisher,
        }
    }

    fn publish(&self, session: &SessionId, signal: &str, payload: Value) {
        let envelope = MessageEnvelope::new(self.name.clone(), session.clone(), signal, payload);
        if let Err(e) = self.publisher.publish(envelope) {
            warn!(analysis = %self.name, %session, signal, error = %e, "publish failed");
        }
    }
}

impl AnalysisAdapter for BusAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Bus
    }

    fn is_available(&self) -> bool {
        self.publisher.subscriber_count(&self.name) > 0
    }

    fn on_connect(&mut self, session: &SessionId, args: &ConnectArgs) -> Vec<MessageEnvelope> {
        self.publish(session, "connect", Value::Null);
        self.publish(session, "args", args.to_payload());
        self.publish(session, "connected", Value::Null);
        Vec::new()
    }

    fn on_browser_event(
        &mut self,
        session: &SessionId,
        signal: &str,
        payload: Value,
    ) -> Vec<MessageEnvelope> {
        debug!(analysis = %self.name, %session, signal, "forwarding to kernel");
        self.publish(session, signal, payload);
        Vec::new()
    }

    fn on_kernel_event(&mut self, envelope: MessageEnvelope) -> Option<MessageEnvelope> {
        if envelope.target != self.name {
            warn!(
                analysis = %self.name,
                target = %envelope.target,
                "kernel envelope for another analysis dropped"
            );
            return None;
        }
        Some(envelope)
    }

    fn on_disconnect(&mut self, session: &SessionId) {
        self.publish(session, "disconnected", Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusClient, MessageBus};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn browser_events_become_addressed_envelopes() {
        let bus = MessageBus::bind(0).await.unwrap();
        let mut kernel = BusClient::connect(bus.address(), "demo2").await.unwrap();
        let mut adapter = BusAdapter::new("demo2", bus.publisher());
        assert!(adapter.is_available());

        let s1 = SessionId::from("s1");
        let out = adapter.on_browser_event(&s1, "run", json!({"x": 1}));
        assert!(out.is_empty());

        let received = tokio::time::timeout(Duration::from_secs(2), kernel.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            received,
            MessageEnvelope::new("demo2", s1, "run", json!({"x": 1}))
        );
    }

    #[tokio::test]
    async fn connect_forwards_lifecycle_in_order() {
        let bus = MessageBus::bind(0).await.unwrap();
        let mut kernel = BusClient::connect(bus.address(), "demo2").await.unwrap();
        let mut adapter = BusAdapter::new("demo2", bus.publisher());

        adapter.on_connect(&SessionId::from("s1"), &ConnectArgs::default());
        let mut signals = Vec::new();
        for _ in 0..3 {
            signals.push(kernel.recv().await.unwrap().unwrap().signal);
        }
        assert_eq!(signals, vec!["connect", "args", "connected"]);
    }

    #[tokio::test]
    async fn unavailable_without_kernel() {
        let bus = MessageBus::bind(0).await.unwrap();
        let adapter = BusAdapter::new("demo2", bus.publisher());
        assert!(!adapter.is_available());
    }

    #[tokio::test]
    async fn kernel_events_for_other_targets_are_dropped() {
        let bus = MessageBus::bind(0).await.unwrap();
        let mut adapter = BusAdapter::new("demo2", bus.publisher());
        let foreign = MessageEnvelope::new("other", SessionId::from("s1"), "x", Value::Null);
        assert!(adapter.on_kernel_event(foreign).is_none());

        let own = MessageEnvelope::new("demo2", SessionId::from("s1"), "x", Value::Null);
        assert_eq!(adapter.on_kernel_event(own.clone()), Some(own));
    }
}
