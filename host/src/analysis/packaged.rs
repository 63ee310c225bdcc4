//! Analyses shipped with the host.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use super::{Analysis, AnalysisError, AnalysisRegistry, Dispatch, Emitter};

const DEFAULT_SAMPLES: u64 = 500;
const REPORT_EVERY: u64 = 100;
/// Upper bound for `samples`. One run at the bound emits 201 frames, which
/// fits a browser connection's outbound queue.
pub const MAX_SAMPLES: u64 = 10_000;

/// Registers every packaged analysis.
pub fn register(registry: &mut AnalysisRegistry) {
    registry
        .register("dummypi", || Box::new(DummyPi::default()))
        .register_routes("dummypi", Router::new().route("/about", get(about)));
}

async fn about() -> Json<Value> {
    Json(json!({
        "name": "dummypi",
        "sequence": "halton",
        "default_samples": DEFAULT_SAMPLES,
        "max_samples": MAX_SAMPLES,
    }))
}

/// Estimates π by sampling the unit square.
///
/// Points come from the 2-D Halton sequence, so runs are reproducible and
/// every run continues where the previous one stopped.
#[derive(Debug)]
pub struct DummyPi {
    samples: u64,
    cursor: u64,
}

impl Default for DummyPi {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            cursor: 0,
        }
    }
}

impl DummyPi {
    fn run(&mut self, emit: &mut Emitter) {
        let mut inside = 0u64;
        for i in 0..self.samples {
            self.cursor += 1;
            let (r1, r2) = (halton(self.cursor, 2), halton(self.cursor, 3));
            if r1 * r1 + r2 * r2 < 1.0 {
                inside += 1;
            }

            let draws = i + 1;
            if draws % REPORT_EVERY == 0 {
                emit.emit(
                    "log",
                    json!({"draws": draws, "inside": inside, "r1": r1, "r2": r2}),
                );
                #[allow(clippy::cast_precision_loss)]
                let (inside_f, draws_f) = (inside as f64, draws as f64);
                let p = inside_f / draws_f;
                let uncertainty = 4.0 * (draws_f * p * (1.0 - p)).sqrt() / draws_f;
                emit.emit(
                    "status",
                    json!({"pi-estimate": 4.0 * p, "pi-uncertainty": uncertainty}),
                );
            }
        }
        emit.emit("log", json!({"action": "done"}));
    }
}

impl Analysis for DummyPi {
    fn on_signal(
        &mut self,
        signal: &str,
        payload: Value,
        emit: &mut Emitter,
    ) -> Result<Dispatch, AnalysisError> {
        match signal {
            "run" => {
                self.run(emit);
                Ok(Dispatch::Handled)
            }
            "samples" => {
                let samples = payload
                    .as_u64()
                    .filter(|n| (1..=MAX_SAMPLES).contains(n))
                    .ok_or_else(|| AnalysisError::InvalidPayload {
                        signal: signal.to_string(),
                        reason: format!("expected an integer in 1..={MAX_SAMPLES}, got {payload}"),
                    })?;
                self.samples = samples;
                Ok(Dispatch::Handled)
            }
            _ => Ok(Dispatch::Unhandled),
        }
    }
}

/// `index`-th element of the van der Corput sequence in `base`.
#[allow(clippy::cast_precision_loss)]
fn halton(mut index: u64, base: u64) -> f64 {
    let mut fraction = 1.0;
    let mut result = 0.0;
    while index > 0 {
        fraction /= base as f64;
        result += fraction * (index % base) as f64;
        index /= base;
    }
    result
}
