//! Push events produced by the acquisition task for the external
//! publisher (MQTT, InfluxDB). The producer never blocks; on overflow the
//! oldest event is dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

/// One per-channel reading, pushed at every accepted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PayloadMeter {
    pub channel: usize,
    pub wall_ms: u64,
    pub active_power: f32,
    pub power_factor: f32,
}

pub trait MeterSink: Send + Sync + 'static {
    /// Hand off one payload. Must not block.
    fn push(&self, payload: PayloadMeter);
}

/// Bounded in-memory queue between the acquisition task and the publisher.
#[derive(Debug)]
pub struct QueueSink {
    queue: Mutex<VecDeque<PayloadMeter>>,
    capacity: usize,
}

impl QueueSink {
    pub fn new(capacity: usize) -> QueueSink {
        QueueSink { queue: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<PayloadMeter> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl MeterSink for QueueSink {
    fn push(&self, payload: PayloadMeter) {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(payload);
    }
}
