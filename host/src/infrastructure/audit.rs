use serde::Serialize;
use tracing::{info, info_span};

/// Domain event for audit logging.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The host finished starting.
    SystemStartup {
        /// Component that started.
        component: String,
    },
    /// The host is shutting down.
    SystemShutdown {
        /// Why.
        reason: String,
    },
    /// A kernel process was launched.
    KernelSpawned {
        /// Analysis served by the kernel.
        analysis: String,
        /// Command line, for the record.
        command: String,
        /// OS process id, if known.
        pid: Option<u32>,
    },
    /// A kernel process ended.
    KernelExited {
        /// Analysis served by the kernel.
        analysis: String,
        /// Exit code; `None` when killed by a signal.
        code: Option<i32>,
        /// Whether the host asked it to stop.
        requested: bool,
    },
    /// An analysis will not accept sessions.
    AnalysisUnavailable {
        /// Analysis name.
        analysis: String,
        /// Why.
        reason: String,
    },
}

/// Logs an audit event to the dedicated audit channel as structured JSON.
/// This uses a specific `target` which can be filtered by the subscriber to redirect to a separate sink.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Audit Event");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_events_serialize_with_tag() {
        let json = serde_json::to_value(AuditEvent::KernelExited {
            analysis: "demo2".into(),
            code: Some(1),
            requested: false,
        })
        .unwrap();
        assert_eq!(json["event_type"], "kernel_exited");
        assert_eq!(json["code"], 1);
    }

    #[test]
    fn test_log_audit_variants() {
        log_audit(&AuditEvent::SystemStartup {
            component: "Test".into(),
        });
        log_audit(&AuditEvent::SystemShutdown {
            reason: "Testing".into(),
        });
        log_audit(&AuditEvent::KernelSpawned {
            analysis: "demo2".into(),
            command: "python analysis.py".into(),
            pid: Some(42),
        });
        log_audit(&AuditEvent::AnalysisUnavailable {
            analysis: "demo2".into(),
            reason: "handshake timed out".into(),
        });
    }
}
