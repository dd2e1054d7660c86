//! Destinations for step-level scalar metrics.
//!
//! The detector pushes named values here and never reads them back.

use std::{collections::BTreeMap, sync::Mutex};

/// Receives one scalar per metric per step.
pub trait MetricSink: Send + Sync {
    /// Records `value` under `name`. When `aggregate_over_epoch` is set the
    /// value also contributes to the epoch-level mean of that channel.
    fn record(&self, name: &str, value: f64, aggregate_over_epoch: bool);
}

/// Emits every recorded value as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, name: &str, value: f64, aggregate_over_epoch: bool) {
        tracing::debug!(metric = name, value, epoch = aggregate_over_epoch, "step metric");
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    steps: BTreeMap<String, Vec<f64>>,
    epoch: BTreeMap<String, RunningMean>,
}

/// Keeps every step value and a running mean per channel for the current epoch.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        // A panic while holding the lock leaves only plain numbers behind.
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    /// Every step value recorded under `name`, oldest first.
    pub fn steps(&self, name: &str) -> Vec<f64> {
        self.with_state(|state| state.steps.get(name).cloned().unwrap_or_default())
    }

    /// Mean of the values aggregated under `name` since the last epoch boundary.
    pub fn epoch_mean(&self, name: &str) -> Option<f64> {
        self.with_state(|state| state.epoch.get(name).map(RunningMean::mean))
    }

    /// Closes the current epoch, returning its per-channel means.
    pub fn end_epoch(&self) -> BTreeMap<String, f64> {
        self.with_state(|state| {
            std::mem::take(&mut state.epoch)
                .into_iter()
                .map(|(name, mean)| (name, mean.mean()))
                .collect()
        })
    }
}

impl MetricSink for MemorySink {
    fn record(&self, name: &str, value: f64, aggregate_over_epoch: bool) {
        self.with_state(|state| {
            state.steps.entry(name.to_string()).or_default().push(value);
            if aggregate_over_epoch {
                let mean = state.epoch.entry(name.to_string()).or_default();
                mean.sum += value;
                mean.count += 1;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_tracks_steps_and_epoch_means() {
        let sink = MemorySink::new();
        sink.record("train_loss", 1.0, true);
        sink.record("train_loss", 3.0, true);
        sink.record("debug", 7.0, false);

        assert_eq!(sink.steps("train_loss"), vec![1.0, 3.0]);
        assert_eq!(sink.epoch_mean("train_loss"), Some(2.0));
        assert_eq!(sink.epoch_mean("debug"), None);

        let summary = sink.end_epoch();
        assert_eq!(summary.get("train_loss"), Some(&2.0));
        assert_eq!(sink.epoch_mean("train_loss"), None);
        assert_eq!(sink.steps("train_loss").len(), 2);
    }
}
