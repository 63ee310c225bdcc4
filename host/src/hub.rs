//! The hub: a single task that owns the session router and every adapter.
//!
//! Browser connections and the bus inbound side never touch routing state
//! directly. They send commands to the hub over a channel and the hub applies
//! them one at a time.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterNotFound, AdapterRegistry, ConnectArgs};
use crate::bus::MessageEnvelope;
use crate::router::{ConnectionTx, SessionId, SessionRouter};

const COMMAND_CAPACITY: usize = 1024;

/// Signal announcing the session id to a freshly connected browser.
pub const CONNECT_SIGNAL: &str = "__connect";

/// Errors returned to callers of a [`HubHandle`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The analysis has no adapter.
    #[error(transparent)]
    AdapterNotFound(#[from] AdapterNotFound),
    /// The analysis exists but its kernel is not serving.
    #[error("analysis '{0}' is unavailable")]
    Unavailable(String),
    /// The hub task has stopped.
    #[error("hub is not running")]
    Closed,
}

/// Work items processed by the hub.
#[derive(Debug)]
pub enum HubCommand {
    /// A browser asked to start a session.
    Connect {
        /// Analysis the browser opened.
        analysis: String,
        /// Session id the browser asked to resume, if any.
        requested: Option<SessionId>,
        /// Raw query string of the page.
        request_args: Option<String>,
        /// Outbound channel of the browser connection.
        connection: ConnectionTx,
        /// Receives the session id actually assigned.
        reply: oneshot::Sender<Result<SessionId, HubError>>,
    },
    /// A browser sent an event on an established session.
    Event {
        /// Originating session.
        session: SessionId,
        /// Signal name.
        signal: String,
        /// Signal payload.
        payload: Value,
    },
    /// A browser connection closed.
    Disconnect {
        /// Session that ended.
        session: SessionId,
    },
    /// Asks which analyses accept sessions.
    Availability {
        /// Receives availability keyed by analysis name.
        reply: oneshot::Sender<BTreeMap<String, bool>>,
    },
}

/// Routing state and adapters, driven by [`HubCommand`]s and kernel
/// envelopes.
pub struct Hub {
    adapters: AdapterRegistry,
    router: SessionRouter,
    cli_args: Option<Vec<String>>,
}

impl Hub {
    /// Creates a hub over `adapters`.
    #[must_use]
    pub fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            router: SessionRouter::new(),
            cli_args: None,
        }
    }

    /// Host arguments handed to analyses on connect.
    #[must_use]
    pub fn with_cli_args(mut self, args: Vec<String>) -> Self {
        self.cli_args = Some(args);
        self
    }

    /// Bound sessions.
    #[must_use]
    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    /// Applies one command.
    pub fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect {
                analysis,
                requested,
                request_args,
                connection,
                reply,
            } => {
                let result = self.connect(&analysis, requested, request_args.as_deref(), connection);
                if reply.send(result).is_err() {
                    debug!(%analysis, "connect reply dropped, browser already gone");
                }
            }
            HubCommand::Event {
                session,
                signal,
                payload,
            } => self.browser_event(&session, &signal, payload),
            HubCommand::Disconnect { session } => self.disconnect(&session),
            HubCommand::Availability { reply } => {
                let _ = reply.send(self.adapters.availability());
            }
        }
    }

    /// Binds a new session and runs the adapter's connect sequence.
    ///
    /// # Errors
    ///
    /// Returns `HubError::AdapterNotFound` for unknown analyses and
    /// `HubError::Unavailable` when the adapter cannot serve sessions.
    pub fn connect(
        &mut self,
        analysis: &str,
        requested: Option<SessionId>,
        request_args: Option<&str>,
        connection: ConnectionTx,
    ) -> Result<SessionId, HubError> {
        let available = match self.adapters.get_mut(analysis) {
            Ok(adapter) => adapter.is_available(),
            Err(e) => {
                warn!(error = %e, "connect for unknown analysis");
                metrics::counter!("dashbench_adapter_not_found_total").increment(1);
                return Err(e.into());
            }
        };
        if !available {
            warn!(analysis, "connect refused, analysis unavailable");
            return Err(HubError::Unavailable(analysis.to_string()));
        }

        let session = match requested {
            Some(id) if self.router.analysis_of(&id).is_none() => id,
            _ => SessionId::generate(),
        };
        self.router.bind(session.clone(), analysis, connection);
        self.record_sessions();
        info!(analysis, %session, "session connected");

        let announce = MessageEnvelope::new(
            analysis,
            session.clone(),
            CONNECT_SIGNAL,
            json!({ "analysis_id": session.as_str() }),
        );
        let _ = self.router.route(announce);

        let args = ConnectArgs {
            cli_args: self.cli_args.clone(),
            request_args: request_args.and_then(ConnectArgs::parse_request_args),
        };
        let deliveries = self.adapters.get_mut(analysis)?.on_connect(&session, &args);
        for delivery in deliveries {
            let _ = self.router.route(delivery);
        }
        Ok(session)
    }

    /// Passes a browser event to the session's adapter and routes replies.
    pub fn browser_event(&mut self, session: &SessionId, signal: &str, payload: Value) {
        let Some(analysis) = self.router.analysis_of(session) else {
            warn!(%session, signal, "event from unbound session dropped");
            return;
        };
        let deliveries = match self.adapters.get_mut(analysis) {
            Ok(adapter) => adapter.on_browser_event(session, signal, payload),
            Err(e) => {
                warn!(error = %e, "event dropped");
                metrics::counter!("dashbench_adapter_not_found_total").increment(1);
                return;
            }
        };
        for delivery in deliveries {
            let _ = self.router.route(delivery);
        }
    }

    /// Routes an envelope published by a kernel.
    pub fn kernel_event(&mut self, envelope: MessageEnvelope) {
        let delivery = match self.adapters.get_mut(&envelope.target) {
            Ok(adapter) => adapter.on_kernel_event(envelope),
            Err(e) => {
                warn!(error = %e, "kernel envelope dropped");
                metrics::counter!("dashbench_adapter_not_found_total").increment(1);
                return;
            }
        };
        if let Some(delivery) = delivery {
            let _ = self.router.route(delivery);
        }
    }

    /// Unbinds `session` and tells its adapter.
    pub fn disconnect(&mut self, session: &SessionId) {
        let Some(analysis) = self.router.unbind(session) else {
            debug!(%session, "disconnect for unknown session");
            return;
        };
        self.record_sessions();
        info!(%analysis, %session, "session disconnected");
        if let Ok(adapter) = self.adapters.get_mut(&analysis) {
            adapter.on_disconnect(session);
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_sessions(&self) {
        metrics::gauge!("dashbench_sessions").set(self.router.len() as f64);
    }

    /// Moves the hub onto its own task.
    ///
    /// `inbound` carries envelopes published by kernels; pass `None` when no
    /// bus is running.
    #[must_use]
    pub fn spawn(
        self,
        inbound: Option<mpsc::Receiver<MessageEnvelope>>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(self.run(rx, inbound));
        (HubHandle { commands: tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut inbound: Option<mpsc::Receiver<MessageEnvelope>>,
    ) {
        info!(analyses = ?self.adapters.kinds(), "hub started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                envelope = next_inbound(&mut inbound) => match envelope {
                    Some(envelope) => self.kernel_event(envelope),
                    None => {
                        debug!("bus inbound closed");
                        inbound = None;
                    }
                },
            }
        }
        info!("hub stopped");
    }
}

async fn next_inbound(
    inbound: &mut Option<mpsc::Receiver<MessageEnvelope>>,
) -> Option<MessageEnvelope> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Cheap handle for sending commands to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Starts a session on `analysis` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns the hub's refusal, or `HubError::Closed` if the hub stopped.
    pub async fn connect(
        &self,
        analysis: impl Into<String>,
        requested: Option<SessionId>,
        request_args: Option<String>,
        connection: ConnectionTx,
    ) -> Result<SessionId, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Connect {
            analysis: analysis.into(),
            requested,
            request_args,
            connection,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Forwards a browser event.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub stopped.
    pub async fn event(
        &self,
        session: SessionId,
        signal: impl Into<String>,
        payload: Value,
    ) -> Result<(), HubError> {
        self.send(HubCommand::Event {
            session,
            signal: signal.into(),
            payload,
        })
        .await
    }

    /// Ends a session.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub stopped.
    pub async fn disconnect(&self, session: SessionId) -> Result<(), HubError> {
        self.send(HubCommand::Disconnect { session }).await
    }

    /// Availability of every analysis.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Closed` if the hub stopped.
    pub async fn availability(&self) -> Result<BTreeMap<String, bool>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Availability { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}
