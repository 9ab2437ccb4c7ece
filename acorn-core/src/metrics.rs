use std::collections::HashMap;

use parking_lot::Mutex;

/// Explicit metrics sink handed to trees and trunks at construction. There is
/// deliberately no process-wide collector.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &'static str, by: u64);
    fn record_latency(&self, name: &'static str, micros: u64);
}

/// Sink that drops everything. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr(&self, _name: &'static str, _by: u64) {}
    fn record_latency(&self, _name: &'static str, _micros: u64) {}
}

const RESERVOIR_CAPACITY: usize = 1024;

/// Fixed-size latency ring: old samples are overwritten once the reservoir
/// is full, so memory stays bounded over process lifetime.
#[derive(Debug, Clone, Default)]
struct Reservoir {
    samples: Vec<u64>,
    next: usize,
    recorded: u64,
}

impl Reservoir {
    fn record(&mut self, micros: u64) {
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
            self.next = (self.next + 1) % RESERVOIR_CAPACITY;
        }
        self.recorded += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatencySummary {
    pub recorded: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub mean_micros: f64,
}

/// In-memory counter + latency sink backed by plain maps.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    latencies: Mutex<HashMap<&'static str, Reservoir>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn latency(&self, name: &str) -> Option<LatencySummary> {
        let latencies = self.latencies.lock();
        let reservoir = latencies.get(name)?;
        if reservoir.samples.is_empty() {
            return None;
        }
        let min = *reservoir.samples.iter().min().unwrap_or(&0);
        let max = *reservoir.samples.iter().max().unwrap_or(&0);
        let sum: u64 = reservoir.samples.iter().sum();
        Some(LatencySummary {
            recorded: reservoir.recorded,
            min_micros: min,
            max_micros: max,
            mean_micros: sum as f64 / reservoir.samples.len() as f64,
        })
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &'static str, by: u64) {
        *self.counters.lock().entry(name).or_insert(0) += by;
    }

    fn record_latency(&self, name: &'static str, micros: u64) {
        self.latencies.lock().entry(name).or_default().record(micros);
    }
}
