//! Adapter that runs analysis logic inside the host.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{AdapterKind, AnalysisAdapter, ConnectArgs};
use crate::analysis::{Analysis, AnalysisFactory, Dispatch, Emitter};
use crate::bus::MessageEnvelope;
use crate::router::SessionId;

const PROCESS_ID_KEY: &str = "__process_id";

struct Instance {
    analysis: Box<dyn Analysis>,
    data: Map<String, Value>,
}

/// Runs one analysis instance per session on the hub loop.
pub struct InProcessAdapter {
    name: String,
    factory: AnalysisFactory,
    instances: HashMap<SessionId, Instance>,
}

impl InProcessAdapter {
    /// Creates an adapter for `name` that instantiates analyses with `factory`.
    #[must_use]
    pub fn new(name: impl Into<String>, factory: AnalysisFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            instances: HashMap::new(),
        }
    }

    /// Values stored for signals the analysis does not handle.
    #[must_use]
    pub fn data(&self, session: &SessionId) -> Option<&Map<String, Value>> {
        self.instances.get(session).map(|i| &i.data)
    }

    /// Number of live instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn dispatch(&mut self, session: &SessionId, signal: &str, payload: Value) -> Vec<MessageEnvelope> {
        let Some(instance) = self.instances.get_mut(session) else {
            warn!(analysis = %self.name, %session, signal, "event for unknown session dropped");
            return Vec::new();
        };

        let (process_id, payload) = take_process_id(payload);
        let mut emit = Emitter::new();
        if let Some(id) = &process_id {
            emit.emit("__process", json!({"id": id, "status": "start"}));
        }

        debug!(analysis = %self.name, %session, signal, "dispatching in-process");
        match instance.analysis.on_signal(signal, payload.clone(), &mut emit) {
            Ok(Dispatch::Handled) => {}
            Ok(Dispatch::Unhandled) => {
                instance.data.insert(signal.to_string(), payload);
            }
            Err(e) => {
                warn!(analysis = %self.name, %session, signal, error = %e, "analysis handler failed");
            }
        }

        if let Some(id) = process_id {
            emit.emit("__process", json!({"id": id, "status": "end"}));
        }

        emit.into_events()
            .into_iter()
            .map(|(signal, payload)| {
                MessageEnvelope::new(self.name.clone(), session.clone(), signal, payload)
            })
            .collect()
    }
}

/// Splits a `__process_id` key off an object payload.
fn take_process_id(payload: Value) -> (Option<Value>, Value) {
    match payload {
        Value::Object(mut map) => {
            let id = map.remove(PROCESS_ID_KEY);
            (id, Value::Object(map))
        }
        other => (None, other),
    }
}

impl AnalysisAdapter for InProcessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::InProcess
    }

    fn is_available(&self) -> bool {
        true
    }

    fn on_connect(&mut self, session: &SessionId, args: &ConnectArgs) -> Vec<MessageEnvelope> {
        self.instances.insert(
            session.clone(),
            Instance {
                analysis: (self.factory)(),
                data: Map::new(),
            },
        );
        let mut out = self.dispatch(session, "connect", Value::Null);
        out.extend(self.dispatch(session, "args", args.to_payload()));
        out.extend(self.dispatch(session, "connected", Value::Null));
        out
    }

    fn on_browser_event(
        &mut self,
        session: &SessionId,
        signal: &str,
        payload: Value,
    ) -> Vec<MessageEnvelope> {
        self.dispatch(session, signal, payload)
    }

    fn on_kernel_event(&mut self, envelope: MessageEnvelope) -> Option<MessageEnvelope> {
        warn!(
            analysis = %self.name,
            signal = %envelope.signal,
            "in-process analysis has no kernel, envelope dropped"
        );
        None
    }

    fn on_disconnect(&mut self, session: &SessionId) {
        let _ = self.dispatch(session, "disconnected", Value::Null);
        self.instances.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use std::sync::Arc;

    /// Echoes `ping` as `pong` and handles nothing else.
    struct Echo;

    impl Analysis for Echo {
        fn on_signal(
            &mut self,
            signal: &str,
            payload: Value,
            emit: &mut Emitter,
        ) -> Result<Dispatch, AnalysisError> {
            match signal {
                "ping" => {
                    emit.emit("pong", payload);
                    Ok(Dispatch::Handled)
                }
                "boom" => Err(AnalysisError::Failed("boom".into())),
                _ => Ok(Dispatch::Unhandled),
            }
        }
    }

    fn adapter() -> InProcessAdapter {
        InProcessAdapter::new("demo", Arc::new(|| Box::new(Echo) as Box<dyn Analysis>))
    }

    #[test]
    fn browser_event_is_dispatched_synchronously() {
        let mut adapter = adapter();
        let s1 = SessionId::from("s1");
        adapter.on_connect(&s1, &ConnectArgs::default());

        let out = adapter.on_browser_event(&s1, "ping", json!({"x": 1}));
        assert_eq!(
            out,
            vec![MessageEnvelope::new("demo", s1, "pong", json!({"x": 1}))]
        );
    }

    #[test]
    fn lifecycle_signals_are_stored_when_unhandled() {
        let mut adapter = adapter();
        let s1 = SessionId::from("s1");
        let args = ConnectArgs {
            cli_args: None,
            request_args: ConnectArgs::parse_request_args("?n=3"),
        };
        adapter.on_connect(&s1, &args);

        let data = adapter.data(&s1).unwrap();
        assert!(data.contains_key("connect"));
        assert!(data.contains_key("connected"));
        assert_eq!(data["args"]["request_args"]["n"], json!(["3"]));
    }

    #[test]
    fn process_id_wraps_the_call() {
        let mut adapter = adapter();
        let s1 = SessionId::from("s1");
        adapter.on_connect(&s1, &ConnectArgs::default());

        let out = adapter.on_browser_event(&s1, "ping", json!({"__process_id": 7, "v": 2}));
        let signals: Vec<_> = out.iter().map(|e| e.signal.as_str()).collect();
        assert_eq!(signals, vec!["__process", "pong", "__process"]);
        assert_eq!(out[0].payload, json!({"id": 7, "status": "start"}));
        assert_eq!(out[1].payload, json!({"v": 2}));
        assert_eq!(out[2].payload, json!({"id": 7, "status": "end"}));
    }

    #[test]
    fn sessions_have_separate_instances() {
        let mut adapter = adapter();
        let (s1, s2) = (SessionId::from("s1"), SessionId::from("s2"));
        adapter.on_connect(&s1, &ConnectArgs::default());
        adapter.on_connect(&s2, &ConnectArgs::default());

        adapter.on_browser_event(&s1, "colour", json!("red"));
        assert_eq!(adapter.data(&s1).unwrap()["colour"], json!("red"));
        assert!(!adapter.data(&s2).unwrap().contains_key("colour"));

        adapter.on_disconnect(&s1);
        assert_eq!(adapter.instance_count(), 1);
        assert!(adapter.on_browser_event(&s1, "ping", Value::Null).is_empty());
    }

    #[test]
    fn handler_errors_are_contained() {
        let mut adapter = adapter();
        let s1 = SessionId::from("s1");
        adapter.on_connect(&s1, &ConnectArgs::default());
        assert!(adapter.on_browser_event(&s1, "boom", Value::Null).is_empty());
        assert_eq!(adapter.on_browser_event(&s1, "ping", json!(1)).len(), 1);
    }
}
