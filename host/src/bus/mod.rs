//! Publish/subscribe transport between the host and kernel processes.

pub mod client;
pub mod envelope;
pub mod server;

pub use client::BusClient;
pub use envelope::{ControlFrame, Frame, MalformedEnvelope, MessageEnvelope, CONTROL_TOPIC};
pub use server::{BusPublisher, MessageBus};

use thiserror::Error;

/// Errors raised by the bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    /// Socket failure.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Malformed(#[from] MalformedEnvelope),

    /// No kernel completed the subscribe handshake in time.
    #[error("no subscriber for '{0}' completed the handshake in time")]
    HandshakeTimeout(String),

    /// The peer went away.
    #[error("bus connection closed")]
    Closed,

    /// No `--subscribe-address` flag was supplied to a kernel.
    #[error("missing or invalid --subscribe-address flag")]
    MissingAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::SessionId;
    use serde_json::json;
    use std::time::Duration;

    async fn bus() -> MessageBus {
        MessageBus::bind(0).await.unwrap()
    }

    #[tokio::test]
    async fn subscriber_only_sees_its_target() -> Result<(), BusError> {
        let bus = bus().await;
        let publisher = bus.publisher();
        let mut a = BusClient::connect(bus.address(), "alpha").await?;
        let mut b = BusClient::connect(bus.address(), "beta").await?;

        publisher.publish(MessageEnvelope::new("alpha", SessionId::from("s1"), "run", json!(1)))?;
        publisher.publish(MessageEnvelope::new("beta", SessionId::from("s2"), "run", json!(2)))?;

        let got_a = a.recv().await?.unwrap();
        let got_b = b.recv().await?.unwrap();
        assert_eq!(got_a.target, "alpha");
        assert_eq!(got_a.payload, json!(1));
        assert_eq!(got_b.target, "beta");
        assert_eq!(got_b.payload, json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn handshake_is_observable() -> Result<(), BusError> {
        let bus = bus().await;
        let publisher = bus.publisher();
        assert!(publisher
            .wait_for_subscriber("alpha", Duration::from_millis(50))
            .await
            .is_err());

        let _client = BusClient::connect(bus.address(), "alpha").await?;
        publisher
            .wait_for_subscriber("alpha", Duration::from_secs(2))
            .await?;
        assert_eq!(publisher.subscriber_count("alpha"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn wait_for_subscriber_names_the_missing_analysis() {
        let bus = bus().await;
        let result = bus
            .publisher()
            .wait_for_subscriber("gamma", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(BusError::HandshakeTimeout(name)) if name == "gamma"));
    }

    #[tokio::test]
    async fn kernel_replies_reach_inbound() -> Result<(), BusError> {
        let mut bus = bus().await;
        let mut inbound = bus.take_inbound().unwrap();
        let mut client = BusClient::connect(bus.address(), "alpha").await?;

        client
            .emit(SessionId::from("s1"), "status", json!({"done": true}))
            .await?;
        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.target, "alpha");
        assert_eq!(envelope.session, SessionId::from("s1"));
        assert_eq!(envelope.signal, "status");
        Ok(())
    }

    #[tokio::test]
    async fn kernel_cannot_publish_for_other_analysis() -> Result<(), BusError> {
        let mut bus = bus().await;
        let mut inbound = bus.take_inbound().unwrap();
        let mut client = BusClient::connect(bus.address(), "alpha").await?;

        client
            .publish(MessageEnvelope::new("beta", SessionId::from("s1"), "x", json!(null)))
            .await?;
        client
            .publish(MessageEnvelope::new("alpha", SessionId::from("s1"), "y", json!(null)))
            .await?;

        let envelope = inbound.recv().await.unwrap();
        assert_eq!(envelope.signal, "y");
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_ends_client_stream() -> Result<(), BusError> {
        let bus = bus().await;
        let mut client = BusClient::connect(bus.address(), "alpha").await?;
        bus.shutdown();
        assert!(client.recv().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_quietly() {
        let bus = bus().await;
        let result = bus
            .publisher()
            .publish(MessageEnvelope::new("alpha", SessionId::from("s1"), "run", json!({})));
        assert!(result.is_ok());
    }
}
