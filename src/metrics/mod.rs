// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Lightweight observability for the storage engine.
//!
//! A process-wide [`MetricsCollector`] singleton buffers timestamp-free
//! [`Metric`] samples (allocator used space after each [`Sack::flush`],
//! per-flush wall-clock duration and relocation count from the node
//! [`Provider`](crate::btree::Provider), and node-cache hit/miss counts).
//! [`aggregator::calculate_stats`] turns a window of same-named samples
//! into a count/mean/min/max/percentile summary.
//!
//! This is pure observability: nothing in the storage engine reads these
//! values back, so recording is always safe to skip or ignore.

pub mod aggregator;

pub use aggregator::{calculate_stats, p50, p95, p99, MetricStats};

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// Physical unit a [`Metric`] value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Microseconds,
    Bytes,
    Count,
}

/// A single observability sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub tags: HashMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, unit: MetricUnit) -> Self {
        Self {
            name: name.into(),
            value,
            unit,
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Process-wide metrics sink, guarded by a single `RwLock` over an
/// append-only buffer.
#[derive(Default)]
pub struct MetricsCollector {
    buffer: RwLock<Vec<Metric>>,
}

impl MetricsCollector {
    /// The process-wide collector. Every store handle records into this
    /// same instance; callers who want isolated counts should drain (or
    /// clear) between measurement windows.
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
        INSTANCE.get_or_init(MetricsCollector::default)
    }

    pub fn record(&self, metric: Metric) {
        self.buffer.write().unwrap().push(metric);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.read().unwrap().len()
    }

    /// Removes and returns every metric recorded since the last drain.
    pub fn drain(&self) -> Vec<Metric> {
        std::mem::take(&mut self.buffer.write().unwrap())
    }

    pub fn clear(&self) {
        self.buffer.write().unwrap().clear();
    }

    /// Aggregated stats over every buffered sample named `name`.
    pub fn stats_for(&self, name: &str) -> Option<MetricStats> {
        let buffer = self.buffer.read().unwrap();
        let values: Vec<f64> = buffer
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.value)
            .collect();
        calculate_stats(&values)
    }
}
