// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test support: a telemetry provider that records spans, events and
//! instrument updates so tests can assert on what the layers emitted.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::telemetry::{AttrValue, Counter, Histogram, Span, TelemetryProvider};

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub name: String,
    pub attrs: Vec<(String, AttrValue)>,
}

#[derive(Clone, Debug)]
pub struct RecordedSpan {
    pub name: String,
    pub attrs: Vec<(String, AttrValue)>,
    pub events: Vec<RecordedEvent>,
    pub started: Instant,
    pub ended: Option<Instant>,
}

#[derive(Default)]
struct Recorded {
    spans: Vec<RecordedSpan>,
    counters: Vec<(String, u64)>,
    histograms: Vec<(String, f64)>,
}

/// Telemetry provider whose entire output can be inspected afterwards.
#[derive(Clone, Default)]
pub struct RecordingTelemetry {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.recorded.lock().unwrap().spans.clone()
    }

    /// All events across all spans, in emission order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.recorded
            .lock()
            .unwrap()
            .spans
            .iter()
            .flat_map(|s| s.events.iter().cloned())
            .collect()
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.recorded
            .lock()
            .unwrap()
            .counters
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .sum()
    }

    pub fn histogram_samples(&self, name: &str) -> Vec<f64> {
        self.recorded
            .lock()
            .unwrap()
            .histograms
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }
}

struct RecordingSpan {
    recorded: Arc<Mutex<Recorded>>,
    index: usize,
    ended: bool,
}

impl Span for RecordingSpan {
    fn set_attribute(&mut self, key: &str, value: AttrValue) {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.spans[self.index]
            .attrs
            .push((key.to_string(), value));
    }

    fn add_event(&mut self, name: &str, attrs: Vec<(String, AttrValue)>) {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.spans[self.index].events.push(RecordedEvent {
            name: name.to_string(),
            attrs,
        });
    }

    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            let mut recorded = self.recorded.lock().unwrap();
            recorded.spans[self.index].ended = Some(Instant::now());
        }
    }
}

impl Drop for RecordingSpan {
    fn drop(&mut self) {
        self.end();
    }
}

struct RecordingCounter {
    recorded: Arc<Mutex<Recorded>>,
    name: String,
}

impl Counter for RecordingCounter {
    fn add(&self, value: u64) {
        self.recorded
            .lock()
            .unwrap()
            .counters
            .push((self.name.clone(), value));
    }
}

struct RecordingHistogram {
    recorded: Arc<Mutex<Recorded>>,
    name: String,
}

impl Histogram for RecordingHistogram {
    fn record(&self, value: f64) {
        self.recorded
            .lock()
            .unwrap()
            .histograms
            .push((self.name.clone(), value));
    }
}

impl TelemetryProvider for RecordingTelemetry {
    fn start_span(&self, name: &str) -> Box<dyn Span> {
        let mut recorded = self.recorded.lock().unwrap();
        let index = recorded.spans.len();
        recorded.spans.push(RecordedSpan {
            name: name.to_string(),
            attrs: Vec::new(),
            events: Vec::new(),
            started: Instant::now(),
            ended: None,
        });
        Box::new(RecordingSpan {
            recorded: Arc::clone(&self.recorded),
            index,
            ended: false,
        })
    }

    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        Arc::new(RecordingCounter {
            recorded: Arc::clone(&self.recorded),
            name: name.to_string(),
        })
    }

    fn histogram(&self, name: &str) -> Arc<dyn Histogram> {
        Arc::new(RecordingHistogram {
            recorded: Arc::clone(&self.recorded),
            name: name.to_string(),
        })
    }
}
