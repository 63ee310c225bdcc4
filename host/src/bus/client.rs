//! Kernel side of the message bus.
//!
//! External kernels written in Rust use [`BusClient`] to join the bus. The
//! host's integration tests use it as a stand-in kernel too.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::envelope::{ControlFrame, Frame, MessageEnvelope};
use super::BusError;
use crate::kernel::SUBSCRIBE_FLAG;
use crate::router::SessionId;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// A kernel's connection to the host bus, filtered to one analysis.
pub struct BusClient {
    filter: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl BusClient {
    /// Connects to `address` and subscribes to envelopes targeting `filter`.
    ///
    /// Returns once the host acknowledged the subscription, so the first
    /// envelope published afterwards is not lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the handshake is not
    /// acknowledged in time.
    pub async fn connect(address: SocketAddr, filter: impl Into<String>) -> Result<Self, BusError> {
        let filter = filter.into();
        let stream = TcpStream::connect(address).await?;
        let (read, mut writer) = stream.into_split();
        let subscribe = Frame::Control(ControlFrame::Subscribe {
            filter: filter.clone(),
        });
        writer.write_all(subscribe.encode()?.as_bytes()).await?;

        let mut lines = BufReader::new(read).lines();
        let ready = async {
            while let Some(line) = lines.next_line().await? {
                if Frame::decode(&line)? == Frame::Control(ControlFrame::Ready) {
                    return Ok(());
                }
            }
            Err::<(), BusError>(BusError::Closed)
        };
        tokio::time::timeout(READY_TIMEOUT, ready)
            .await
            .map_err(|_| BusError::HandshakeTimeout(filter.clone()))??;
        debug!(analysis = %filter, "subscribed to bus");

        Ok(Self {
            filter,
            lines,
            writer,
        })
    }

    /// Analysis name this client is subscribed to.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Receives the next envelope. Returns `None` when the host shuts down or
    /// closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or an undecodable frame.
    pub async fn recv(&mut self) -> Result<Option<MessageEnvelope>, BusError> {
        while let Some(line) = self.lines.next_line().await? {
            match Frame::decode(&line)? {
                Frame::Data(envelope) => return Ok(Some(envelope)),
                Frame::Control(ControlFrame::Shutdown) => return Ok(None),
                Frame::Control(_) => {}
            }
        }
        Ok(None)
    }

    /// Publishes an envelope back to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or written.
    pub async fn publish(&mut self, envelope: MessageEnvelope) -> Result<(), BusError> {
        let line = Frame::Data(envelope).encode()?;
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Sends `signal` with `payload` to one browser session.
    ///
    /// # Errors
    ///
    /// See [`BusClient::publish`].
    pub async fn emit(
        &mut self,
        session: SessionId,
        signal: impl Into<String>,
        payload: Value,
    ) -> Result<(), BusError> {
        let envelope = MessageEnvelope::new(self.filter.clone(), session, signal, payload);
        self.publish(envelope).await
    }
}

/// Extracts the bus address from a kernel's command-line arguments.
///
/// # Errors
///
/// Returns `BusError::MissingAddress` if no valid `--subscribe-address=` flag
/// is present.
pub fn subscribe_address_from_args<I, S>(args: I) -> Result<SocketAddr, BusError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = format!("{SUBSCRIBE_FLAG}=");
    args.into_iter()
        .find_map(|arg| {
            arg.as_ref()
                .strip_prefix(&prefix)
                .and_then(|value| value.parse().ok())
        })
        .ok_or(BusError::MissingAddress)
}
