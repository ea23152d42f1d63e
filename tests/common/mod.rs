#![allow(dead_code)]

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use opentelemetry::KeyValue;
use trace_middleware::{Config, Logger, MetricsSink, NoiseFilter};
use tracing::{
    field::{Field, Visit},
    span, Dispatch, Event, Level, Subscriber,
};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer, Registry,
};

pub const ACCESS_TARGET: &str = "trace_middleware::access";

#[derive(Clone, Debug)]
pub struct Record {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

/// Layer keeping every event and span name in memory.
#[derive(Clone, Default)]
pub struct Captured {
    records: Arc<Mutex<Vec<Record>>>,
    spans: Arc<Mutex<Vec<String>>>,
}

impl Captured {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn access_records(&self) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|record| record.target == ACCESS_TARGET)
            .collect()
    }

    pub fn spans(&self) -> Vec<String> {
        self.spans.lock().unwrap().clone()
    }

    pub fn logger(&self) -> Logger {
        Logger::new(Dispatch::new(Registry::default().with(self.clone())))
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        self.spans
            .lock()
            .unwrap()
            .push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));

        let message = fields.remove("message").unwrap_or_default();
        self.records.lock().unwrap().push(Record {
            level: *event.metadata().level(),
            target: event.metadata().target().to_owned(),
            message,
            fields,
        });
    }
}

#[derive(Clone, Debug)]
pub struct Observation {
    pub name: &'static str,
    pub value: f64,
    pub labels: HashMap<String, String>,
}

impl Observation {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Metrics sink keeping every observation in memory.
#[derive(Default)]
pub struct MemoryMetrics {
    added: Mutex<Vec<Observation>>,
    observed: Mutex<Vec<Observation>>,
}

impl MemoryMetrics {
    pub fn added(&self, name: &str) -> Vec<Observation> {
        self.added
            .lock()
            .unwrap()
            .iter()
            .filter(|observation| observation.name == name)
            .cloned()
            .collect()
    }

    pub fn total(&self, name: &str) -> f64 {
        self.added(name)
            .iter()
            .map(|observation| observation.value)
            .sum()
    }

    pub fn observed(&self, name: &str) -> Vec<Observation> {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|observation| observation.name == name)
            .cloned()
            .collect()
    }
}

fn labels(attributes: &[KeyValue]) -> HashMap<String, String> {
    attributes
        .iter()
        .map(|kv| (kv.key.as_str().to_owned(), kv.value.to_string()))
        .collect()
}

impl MetricsSink for MemoryMetrics {
    fn add(&self, name: &'static str, value: u64, attributes: &[KeyValue]) {
        self.added.lock().unwrap().push(Observation {
            name,
            value: value as f64,
            labels: labels(attributes),
        });
    }

    fn observe(&self, name: &'static str, seconds: f64, attributes: &[KeyValue]) {
        self.observed.lock().unwrap().push(Observation {
            name,
            value: seconds,
            labels: labels(attributes),
        });
    }
}

/// Config wired to in-memory log capture and metrics.
pub fn harness() -> (Config, Captured, Arc<MemoryMetrics>) {
    let captured = Captured::default();
    let metrics = Arc::new(MemoryMetrics::default());

    let config = Config::new()
        .with_logger(captured.logger())
        .with_metrics(metrics.clone())
        .with_noise_filter(NoiseFilter::default())
        .with_handled_histogram(true);

    (config, captured, metrics)
}
