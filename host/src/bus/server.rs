//! Host side of the message bus.
//!
//! The bus owns one TCP listener on the loopback interface. Each kernel opens
//! a single connection, announces the analysis it serves with a `subscribe`
//! control frame and receives `ready` once its filter is active. From then on
//! the connection is bidirectional: the host pushes envelopes whose target
//! matches the filter, and the kernel writes envelopes back, which surface on
//! the bus inbound channel.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{ControlFrame, Frame, MalformedEnvelope, MessageEnvelope};
use super::BusError;

const BROADCAST_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type SubscriberTable = HashMap<String, usize>;

/// Cloneable publishing side of the bus.
#[derive(Clone)]
pub struct BusPublisher {
    sender: broadcast::Sender<Arc<Frame>>,
    subscribers: Arc<watch::Sender<SubscriberTable>>,
    address: SocketAddr,
}

impl BusPublisher {
    /// Address kernels connect to.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Broadcasts an envelope to every subscriber filtering on its target.
    ///
    /// Delivery is best effort: with no matching subscriber the envelope is
    /// dropped silently.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEnvelope::InvalidTopic` if the target cannot be used
    /// as a topic.
    pub fn publish(&self, envelope: MessageEnvelope) -> Result<(), MalformedEnvelope> {
        if !super::envelope::is_valid_topic(&envelope.target) {
            return Err(MalformedEnvelope::InvalidTopic(envelope.target));
        }
        let target = envelope.target.clone();
        self.send(Frame::Data(envelope));
        metrics::counter!("dashbench_bus_published_total", "target" => target).increment(1);
        Ok(())
    }

    fn send(&self, frame: Frame) {
        match self.sender.send(Arc::new(frame)) {
            Ok(receivers) => debug!(receivers, "frame broadcast"),
            Err(_) => debug!("frame dropped, no bus connections"),
        }
    }

    /// Number of completed handshakes for `analysis`.
    #[must_use]
    pub fn subscriber_count(&self, analysis: &str) -> usize {
        self.subscribers
            .borrow()
            .get(analysis)
            .copied()
            .unwrap_or(0)
    }

    /// Waits until a kernel has completed its handshake for `analysis`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::HandshakeTimeout` if no subscriber shows up in time.
    pub async fn wait_for_subscriber(
        &self,
        analysis: &str,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let mut table = self.subscribers.subscribe();
        let ready = table.wait_for(|t| t.get(analysis).copied().unwrap_or(0) > 0);
        // Bound to a local so the `watch::Ref` is dropped before `table`.
        let outcome = tokio::time::timeout(timeout, ready).await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::HandshakeTimeout(analysis.to_string())),
        }
    }
}

/// Owner of the bus listener and its inbound channel.
pub struct MessageBus {
    publisher: BusPublisher,
    inbound: Option<mpsc::Receiver<MessageEnvelope>>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl MessageBus {
    /// Binds the bus on `127.0.0.1:<port>` and starts accepting kernels.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Io` if the port cannot be bound.
    pub async fn bind(port: u16) -> Result<Self, BusError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        let address = listener.local_addr()?;
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (subscribers, _) = watch::channel(SubscriberTable::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let publisher = BusPublisher {
            sender,
            subscribers: Arc::new(subscribers),
            address,
        };

        info!(%address, "message bus listening");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            publisher.clone(),
            inbound_tx,
            shutdown_rx,
        ));

        Ok(Self {
            publisher,
            inbound: Some(inbound_rx),
            shutdown,
            accept_task,
        })
    }

    /// Returns a publishing handle.
    #[must_use]
    pub fn publisher(&self) -> BusPublisher {
        self.publisher.clone()
    }

    /// Address kernels connect to.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.publisher.address
    }

    /// Takes the channel of envelopes published by kernels. Only the first
    /// call returns `Some`.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<MessageEnvelope>> {
        self.inbound.take()
    }

    /// Tells every kernel to exit and stops accepting connections.
    pub fn shutdown(&self) {
        info!("message bus shutting down");
        self.publisher.send(Frame::Control(ControlFrame::Shutdown));
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    publisher: BusPublisher,
    inbound: mpsc::Sender<MessageEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        debug!(%peer, "kernel connection accepted");
                        // Subscribe before the handshake so nothing published
                        // after `ready` can be missed.
                        let frames = publisher.sender.subscribe();
                        let connection = KernelConnection {
                            stream,
                            peer,
                            frames,
                            inbound: inbound.clone(),
                            subscribers: Arc::clone(&publisher.subscribers),
                        };
                        tokio::spawn(connection.run());
                    }
                    Err(e) => warn!(error = %e, "bus accept failed"),
                }
            }
        }
    }
    debug!("bus accept loop stopped");
}

struct KernelConnection {
    stream: TcpStream,
    peer: SocketAddr,
    frames: broadcast::Receiver<Arc<Frame>>,
    inbound: mpsc::Sender<MessageEnvelope>,
    subscribers: Arc<watch::Sender<SubscriberTable>>,
}

impl KernelConnection {
    async fn run(self) {
        let Self {
            stream,
            peer,
            mut frames,
            inbound,
            subscribers,
        } = self;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let filter = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => match Frame::decode(&line) {
                Ok(Frame::Control(ControlFrame::Subscribe { filter })) => filter,
                Ok(other) => {
                    warn!(%peer, topic = other.topic(), "expected subscribe frame, closing");
                    return;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "malformed handshake, closing");
                    return;
                }
            },
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "handshake read failed");
                return;
            }
            Err(_) => {
                warn!(%peer, "handshake timed out");
                return;
            }
        };

        // Counted before `ready` so the kernel never observes an ack the
        // table does not reflect yet.
        subscribers.send_modify(|table| *table.entry(filter.clone()).or_default() += 1);
        let acknowledged =
            match write_frame(&mut write, &Frame::Control(ControlFrame::Ready)).await {
                Ok(()) => {
                    info!(%peer, analysis = %filter, "kernel subscribed");
                    true
                }
                Err(e) => {
                    warn!(%peer, error = %e, "failed to acknowledge subscribe");
                    false
                }
            };

        if acknowledged {
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !forward_inbound(&line, &filter, &inbound).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(analysis = %filter, "kernel closed bus connection");
                            break;
                        }
                        Err(e) => {
                            warn!(analysis = %filter, error = %e, "bus read failed");
                            break;
                        }
                    },
                    frame = frames.recv() => match frame {
                        Ok(frame) => {
                            if !frame.matches(&filter) {
                                continue;
                            }
                            if let Err(e) = write_frame(&mut write, &frame).await {
                                warn!(analysis = %filter, error = %e, "bus write failed");
                                break;
                            }
                            if matches!(*frame, Frame::Control(ControlFrame::Shutdown)) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(analysis = %filter, skipped, "kernel lagging, frames dropped");
                            metrics::counter!("dashbench_bus_dropped_total", "target" => filter.clone())
                                .increment(skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }

        subscribers.send_modify(|table| {
            if let Some(count) = table.get_mut(&filter) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    table.remove(&filter);
                }
            }
        });
        info!(analysis = %filter, "kernel unsubscribed");
    }
}

/// Decodes one kernel line and forwards it. Returns false once the host side
/// of the inbound channel is gone.
async fn forward_inbound(
    line: &str,
    filter: &str,
    inbound: &mpsc::Sender<MessageEnvelope>,
) -> bool {
    match Frame::decode(line) {
        Ok(Frame::Data(envelope)) if envelope.target == filter => {
            inbound.send(envelope).await.is_ok()
        }
        Ok(Frame::Data(envelope)) => {
            warn!(
                analysis = %filter,
                target = %envelope.target,
                "kernel published outside its subscription, dropped"
            );
            true
        }
        Ok(Frame::Control(control)) => {
            debug!(analysis = %filter, ?control, "ignoring control frame from kernel");
            true
        }
        Err(e) => {
            warn!(analysis = %filter, error = %e, "malformed envelope from kernel, dropped");
            metrics::counter!("dashbench_bus_malformed_total").increment(1);
            true
        }
    }
}

async fn write_frame<W>(write: &mut W, frame: &Frame) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
{
    let line = frame.encode()?;
    write.write_all(line.as_bytes()).await?;
    Ok(())
}
