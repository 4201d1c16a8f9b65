//! A minimal counter/gauge registry. Values are derived from `tracing`
//! events at the call site and also kept here so an external sink can
//! poll them; no exporter is wired up in core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<&'static str, AtomicI64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str, by: i64) {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self, name: &'static str) -> i64 {
        self.counters
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<&'static str, i64> {
        self.counters
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.incr("events_published", 1);
        registry.incr("events_published", 2);
        assert_eq!(registry.get("events_published"), 3);
        assert_eq!(registry.get("unknown"), 0);
    }
}
