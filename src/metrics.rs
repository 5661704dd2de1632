//! Labelled monotonic counters.
//!
//! A [`MetricsRegistry`] hands out [`CounterVec`] families by name. Each family
//! is partitioned by an ordered set of label names; [`CounterVec::labels`]
//! resolves one label tuple to a [`Counter`] handle that can only go up.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use crate::identity::NodeIdentity;

/// Label names shared by all node counters, in label order.
pub const NODE_LABELS: [&str; 4] = ["node_id", "node_name", "node_type", "host"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricsError {
    #[error("Counter {name} expects {expected} label values, got {got}")]
    LabelCardinality {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Counter {name} is already registered with different label names")]
    Conflict { name: String },
}

/// Handle to a single labelled series.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A counter family keyed by label values.
#[derive(Debug)]
pub struct CounterVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    series: RwLock<HashMap<Vec<String>, Counter>>,
}

impl CounterVec {
    fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the series for `values`, creating it at zero on first use.
    pub fn labels(&self, values: &[&str]) -> Result<Counter, MetricsError> {
        if values.len() != self.label_names.len() {
            return Err(MetricsError::LabelCardinality {
                name: self.name.clone(),
                expected: self.label_names.len(),
                got: values.len(),
            });
        }

        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        if let Ok(series) = self.series.read() {
            if let Some(counter) = series.get(&key) {
                return Ok(counter.clone());
            }
        }

        let mut series = self.series.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(series.entry(key).or_default().clone())
    }

    /// Current value of a series, zero if it was never touched.
    pub fn get(&self, values: &[&str]) -> u64 {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.series
            .read()
            .ok()
            .and_then(|series| series.get(&key).map(Counter::get))
            .unwrap_or(0)
    }

    fn render_into(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);

        let series = self.series.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let sorted: BTreeMap<&Vec<String>, u64> = series.iter().map(|(k, c)| (k, c.get())).collect();
        for (values, count) in sorted {
            let labels = self
                .label_names
                .iter()
                .zip(values)
                .map(|(name, value)| format!("{}=\"{}\"", name, escape_label(value)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{}{{{}}} {}", self.name, labels, count);
        }
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Process-level collection of counter families.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<Vec<Arc<CounterVec>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter family `name`.
    ///
    /// Registering an existing name returns the same family as long as the
    /// label names match.
    pub fn counter(&self, name: &str, help: &str, label_names: &[&str]) -> Result<Arc<CounterVec>, MetricsError> {
        let mut counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = counters.iter().find(|c| c.name() == name) {
            if existing.label_names.iter().map(String::as_str).ne(label_names.iter().copied()) {
                return Err(MetricsError::Conflict { name: name.to_string() });
            }
            return Ok(existing.clone());
        }

        let counter = Arc::new(CounterVec::new(name, help, label_names));
        counters.push(counter.clone());
        Ok(counter)
    }

    /// Prometheus text exposition of every registered family.
    pub fn render(&self) -> String {
        let counters = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = String::new();
        for counter in counters.iter() {
            counter.render_into(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// The four traffic counters of one node, bound to its label tuple.
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    bytes_received: Counter,
    bytes_sent: Counter,
    messages_received: Counter,
    messages_sent: Counter,
}

impl NodeMetrics {
    pub fn new(registry: &MetricsRegistry, identity: &NodeIdentity, host: &str) -> Result<Self, MetricsError> {
        let labels = [
            identity.node_id.as_str(),
            identity.name_label(),
            identity.node_type.as_str(),
            host,
        ];
        let bind = |name: &str, help: &str| registry.counter(name, help, &NODE_LABELS)?.labels(&labels);

        Ok(Self {
            bytes_received: bind("node_bytes_received_total", "Total number of bytes received by node")?,
            bytes_sent: bind("node_bytes_sent_total", "Total number of bytes sent by node")?,
            messages_received: bind("node_messages_received_total", "Total number of messages received by node")?,
            messages_sent: bind("node_messages_sent_total", "Total number of messages sent by node")?,
        })
    }

    pub fn record_received(&self, payload_len: usize) {
        self.messages_received.inc();
        self.bytes_received.inc_by(payload_len as u64);
    }

    pub fn record_bytes_sent(&self, payload_len: usize) {
        self.bytes_sent.inc_by(payload_len as u64);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            messages_sent: self.messages_sent.get(),
            messages_received: self.messages_received.get(),
        }
    }
}
