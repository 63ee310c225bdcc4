//! Analysis adapters: one capability interface, two transports.
//!
//! An adapter turns browser events into work for its analysis and turns the
//! analysis' replies into envelopes for the session router. In-process
//! adapters call the analysis directly; bus adapters publish envelopes to an
//! external kernel and relay what it publishes back.

pub mod bus;
pub mod in_process;

pub use bus::BusAdapter;
pub use in_process::InProcessAdapter;

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::analysis::{AnalysisDescriptor, AnalysisRegistry};
use crate::bus::{BusPublisher, MessageEnvelope};
use crate::router::SessionId;

/// Arguments handed to an analysis when a session connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectArgs {
    /// Host command-line arguments, if the host exposes them.
    pub cli_args: Option<Vec<String>>,
    /// Query string of the page that opened the session, parsed.
    pub request_args: Option<BTreeMap<String, Vec<String>>>,
}

impl ConnectArgs {
    /// Parses a raw query string such as `?a=1&b=2&a=3` into
    /// `{a: [1, 3], b: [2]}`. Empty input yields `None`.
    #[must_use]
    pub fn parse_request_args(query: &str) -> Option<BTreeMap<String, Vec<String>>> {
        let query = query.trim_start_matches('?');
        if query.is_empty() {
            return None;
        }
        let mut args: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            args.entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Some(args)
    }

    fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Transport behind an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Analysis logic lives in the host process.
    InProcess,
    /// Analysis logic lives in an external kernel reached over the bus.
    Bus,
}

/// Capability interface shared by both adapter variants.
pub trait AnalysisAdapter: Send {
    /// Analysis served by this adapter.
    fn name(&self) -> &str;

    /// Transport used.
    fn kind(&self) -> AdapterKind;

    /// Whether new sessions can be served right now.
    fn is_available(&self) -> bool;

    /// Starts serving `session`. Returns envelopes for the router.
    fn on_connect(&mut self, session: &SessionId, args: &ConnectArgs) -> Vec<MessageEnvelope>;

    /// Handles an event from a browser session. Returns envelopes for the
    /// router; bus adapters return none and answer asynchronously.
    fn on_browser_event(
        &mut self,
        session: &SessionId,
        signal: &str,
        payload: Value,
    ) -> Vec<MessageEnvelope>;

    /// Handles an envelope published by the analysis' kernel. Returns the
    /// envelope to route, addressed to its originating session.
    fn on_kernel_event(&mut self, envelope: MessageEnvelope) -> Option<MessageEnvelope>;

    /// Stops serving `session`.
    fn on_disconnect(&mut self, session: &SessionId);
}

/// Raised when an analysis name has no adapter.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no adapter registered for analysis '{0}'")]
pub struct AdapterNotFound(pub String);

/// Adapters keyed by analysis name. Built once at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn AnalysisAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one adapter per descriptor.
    ///
    /// In-process descriptors without a registered factory are skipped with a
    /// warning.
    #[must_use]
    pub fn from_descriptors(
        descriptors: &[AnalysisDescriptor],
        analyses: &AnalysisRegistry,
        publisher: &BusPublisher,
    ) -> Self {
        let mut registry = Self::new();
        for descriptor in descriptors {
            if descriptor.kernel.is_external() {
                registry.insert(Box::new(BusAdapter::new(
                    descriptor.name.clone(),
                    publisher.clone(),
                )));
            } else if let Some(factory) = analyses.factory(&descriptor.name) {
                registry.insert(Box::new(InProcessAdapter::new(
                    descriptor.name.clone(),
                    factory,
                )));
            } else {
                warn!(analysis = %descriptor.name, "no in-process analysis registered, skipping");
            }
        }
        registry
    }

    /// Adds an adapter, replacing any adapter with the same name.
    pub fn insert(&mut self, adapter: Box<dyn AnalysisAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Adapter for `name`.
    ///
    /// # Errors
    ///
    /// Returns `AdapterNotFound` if no adapter serves `name`.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut (dyn AnalysisAdapter + 'static), AdapterNotFound> {
        self.adapters
            .get_mut(name)
            .map(Box::as_mut)
            .ok_or_else(|| AdapterNotFound(name.to_string()))
    }

    /// Returns true if an adapter serves `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Whether each adapter can serve new sessions right now.
    #[must_use]
    pub fn availability(&self) -> BTreeMap<String, bool> {
        self.adapters
            .iter()
            .map(|(name, a)| (name.clone(), a.is_available()))
            .collect()
    }

    /// Names and transports of all adapters.
    #[must_use]
    pub fn kinds(&self) -> Vec<(String, AdapterKind)> {
        self.adapters
            .values()
            .map(|a| (a.name().to_string(), a.kind()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::KernelKind;
    use crate::bus::MessageBus;

    #[test]
    fn request_args_are_grouped_by_key() {
        let args = ConnectArgs::parse_request_args("?a=1&b=two%20words&a=3").unwrap();
        assert_eq!(args["a"], vec!["1", "3"]);
        assert_eq!(args["b"], vec!["two words"]);
        assert!(ConnectArgs::parse_request_args("?").is_none());
    }

    #[tokio::test]
    async fn descriptors_select_adapter_kind() {
        let bus = MessageBus::bind(0).await.unwrap();
        let descriptors = vec![
            AnalysisDescriptor::new("dummypi", KernelKind::None),
            AnalysisDescriptor::new("external", KernelKind::Python),
            AnalysisDescriptor::new("unregistered", KernelKind::None),
        ];
        let mut registry = AdapterRegistry::from_descriptors(
            &descriptors,
            &AnalysisRegistry::packaged(),
            &bus.publisher(),
        );

        assert_eq!(registry.get_mut("dummypi").unwrap().kind(), AdapterKind::InProcess);
        assert_eq!(registry.get_mut("external").unwrap().kind(), AdapterKind::Bus);
        assert!(!registry.contains("unregistered"));
        let availability = registry.availability();
        assert_eq!(availability.get("dummypi"), Some(&true));
        assert_eq!(availability.get("external"), Some(&false));
        assert_eq!(
            registry.get_mut("ghost").err(),
            Some(AdapterNotFound("ghost".into()))
        );
    }
}
