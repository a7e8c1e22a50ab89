use serde_json::Value;

use crate::core::ports::emitter::EmitterPort;

/// Forwards run events to the `log` facade under the `relay::events` target,
/// so `RUST_LOG=relay::events=debug` streams them as JSON lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

impl LogEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl EmitterPort for LogEmitter {
    fn emit(&self, channel: &str, payload: &Value) {
        log::debug!(target: "relay::events", "{channel} {payload}");
    }
}
