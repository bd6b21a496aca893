// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Abstract observability surface used by the layers.
//!
//! The export plumbing (OTLP wiring, span processors) is supplied by an
//! external collaborator; the core only depends on these traits. The
//! built-in [`LogTelemetry`] shim forwards everything to `tracing` so a
//! mounted filesystem is observable without any backend attached.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

/// A span or event attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::I64(v) => write!(f, "{v}"),
            AttrValue::U64(v) => write!(f, "{v}"),
            AttrValue::F64(v) => write!(f, "{v}"),
            AttrValue::Str(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::U64(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::I64(v)
    }
}

/// One operation's trace span. `end` is idempotent; dropping an unended
/// span ends it.
pub trait Span: Send {
    fn set_attribute(&mut self, key: &str, value: AttrValue);
    fn add_event(&mut self, name: &str, attrs: Vec<(String, AttrValue)>);
    fn end(&mut self);
}

pub trait Counter: Send + Sync {
    fn add(&self, value: u64);
}

pub trait Histogram: Send + Sync {
    fn record(&self, value: f64);
}

/// Factory for spans and instruments. Implementations must be cheap to
/// call per request.
pub trait TelemetryProvider: Send + Sync {
    fn start_span(&self, name: &str) -> Box<dyn Span>;
    fn counter(&self, name: &str) -> Arc<dyn Counter>;
    fn histogram(&self, name: &str) -> Arc<dyn Histogram>;
}

/// Discards everything.
#[derive(Default)]
pub struct NoopTelemetry;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: AttrValue) {}
    fn add_event(&mut self, _name: &str, _attrs: Vec<(String, AttrValue)>) {}
    fn end(&mut self) {}
}

struct NoopInstrument;

impl Counter for NoopInstrument {
    fn add(&self, _value: u64) {}
}

impl Histogram for NoopInstrument {
    fn record(&self, _value: f64) {}
}

impl TelemetryProvider for NoopTelemetry {
    fn start_span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }

    fn counter(&self, _name: &str) -> Arc<dyn Counter> {
        Arc::new(NoopInstrument)
    }

    fn histogram(&self, _name: &str) -> Arc<dyn Histogram> {
        Arc::new(NoopInstrument)
    }
}

/// Shim that renders spans and instruments as `tracing` events. The
/// collector endpoint is carried opaquely for the real exporter to pick
/// up; this shim only logs it once at construction.
pub struct LogTelemetry {
    endpoint: Option<String>,
}

impl LogTelemetry {
    pub fn new(endpoint: Option<String>) -> Self {
        if let Some(endpoint) = &endpoint {
            debug!(target: "interposefs::telemetry", endpoint = %endpoint, "collector endpoint configured");
        }
        Self { endpoint }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

struct LogSpan {
    name: String,
    started: Instant,
    ended: bool,
}

impl Span for LogSpan {
    fn set_attribute(&mut self, key: &str, value: AttrValue) {
        debug!(target: "interposefs::telemetry", span = %self.name, key, %value, "attribute");
    }

    fn add_event(&mut self, name: &str, attrs: Vec<(String, AttrValue)>) {
        let rendered = attrs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(target: "interposefs::telemetry", span = %self.name, event = name, attrs = %rendered, "event");
    }

    fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            debug!(
                target: "interposefs::telemetry",
                span = %self.name,
                duration_us = self.started.elapsed().as_micros() as u64,
                "span end"
            );
        }
    }
}

impl Drop for LogSpan {
    fn drop(&mut self) {
        self.end();
    }
}

struct LogCounter {
    name: String,
}

impl Counter for LogCounter {
    fn add(&self, value: u64) {
        debug!(target: "interposefs::telemetry", counter = %self.name, value, "counter add");
    }
}

struct LogHistogram {
    name: String,
}

impl Histogram for LogHistogram {
    fn record(&self, value: f64) {
        debug!(target: "interposefs::telemetry", histogram = %self.name, value, "histogram record");
    }
}

impl TelemetryProvider for LogTelemetry {
    fn start_span(&self, name: &str) -> Box<dyn Span> {
        Box::new(LogSpan {
            name: name.to_string(),
            started: Instant::now(),
            ended: false,
        })
    }

    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        Arc::new(LogCounter {
            name: name.to_string(),
        })
    }

    fn histogram(&self, name: &str) -> Arc<dyn Histogram> {
        Arc::new(LogHistogram {
            name: name.to_string(),
        })
    }
}
