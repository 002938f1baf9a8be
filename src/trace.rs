//! Bounded in-process trace log.
//!
//! Coarse runtime events (loop iterations, tool dispatches, confirmations)
//! land here so the inspection UI can pull a recent execution trace without
//! attaching a debugger. The buffer is a ring: old events fall off the
//! front once the capacity is reached.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub timestamp: f64,
    pub name: String,
    pub detail: Value,
}

#[derive(Clone)]
pub struct TraceLog {
    inner: Arc<Mutex<VecDeque<TraceEvent>>>,
    capacity: usize,
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TraceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, name: &str, detail: Value) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut events = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(TraceEvent {
            timestamp,
            name: name.to_string(),
            detail,
        });
    }

    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.inner
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_snapshot() {
        let trace = TraceLog::new(10);
        trace.record("loop_iteration", json!({"iteration": 1}));
        trace.record("tool_dispatch", json!({"action": "read_file"}));
        let events = trace.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "loop_iteration");
        assert_eq!(events[1].detail["action"], "read_file");
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let trace = TraceLog::new(3);
        for i in 0..5 {
            trace.record("event", json!({"i": i}));
        }
        let events = trace.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].detail["i"], 2);
        assert_eq!(events[2].detail["i"], 4);
    }
}
