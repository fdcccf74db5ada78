use crate::config::AnomalyConfig;
use crate::protocol::TelemetryRecord;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// An in-progress drift for one `(printer_id, field)` pair. Removed once
/// `remaining` reaches zero, so a stored entry always has at least one
/// application left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriftState {
    pub direction: i8,
    pub remaining: u32,
}

/// Injection counters surfaced through simulator logging.
#[derive(Debug, Clone, Default)]
pub struct AnomalyStats {
    pub spikes_injected: u64,
    pub drifts_started: u64,
    pub drifts_completed: u64,
}

/// Probabilistic perturbation engine for synthetic telemetry.
///
/// Spikes are a per-call coin flip with no memory. Drifts persist across
/// calls per `(printer_id, field)` key; this is the only cross-call state
/// in telemetry generation.
#[derive(Debug)]
pub struct AnomalyInjector {
    config: AnomalyConfig,
    drifts: HashMap<(String, String), DriftState>,
    stats: AnomalyStats,
    rng: StdRng,
}

impl AnomalyInjector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    /// Fixed seed for deterministic behavior in tests.
    pub fn with_seed(config: AnomalyConfig, seed: u64) -> Self {
        Self {
            config,
            drifts: HashMap::new(),
            stats: AnomalyStats::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Single-cycle magnitude perturbation: with configured probability,
    /// multiply `field` and tag the record.
    pub fn inject_spike(&mut self, record: &mut TelemetryRecord, field: &str) {
        if self.rng.gen::<f64>() >= self.config.spike_probability {
            return;
        }
        if let Some(value) = record.number(field) {
            record.set_number(field, value * self.config.spike_magnitude);
            record.anomaly = Some(format!("spike_{}", field));
            self.stats.spikes_injected += 1;
        }
    }

    /// Multi-cycle direction-persistent perturbation. May start a new drift
    /// for the key, then applies the active one (if any) and retires it when
    /// its duration is spent.
    pub fn inject_drift(&mut self, record: &mut TelemetryRecord, field: &str) {
        let key = (record.printer_id.clone(), field.to_string());

        if !self.drifts.contains_key(&key)
            && self.rng.gen::<f64>() < self.config.drift_start_probability
        {
            let direction = if self.rng.gen::<bool>() { 1 } else { -1 };
            let duration = self
                .rng
                .gen_range(self.config.drift_min_cycles..=self.config.drift_max_cycles);
            self.drifts.insert(
                key.clone(),
                DriftState {
                    direction,
                    remaining: duration,
                },
            );
            self.stats.drifts_started += 1;
        }

        if let Some(drift) = self.drifts.get_mut(&key) {
            if let Some(value) = record.number(field) {
                let factor = 1.0 + self.config.drift_step * f64::from(drift.direction);
                record.set_number(field, value * factor);
            }
            drift.remaining -= 1;
            record.anomaly = Some(format!("drift_{}", field));

            if drift.remaining == 0 {
                self.drifts.remove(&key);
                self.stats.drifts_completed += 1;
            }
        }
    }

    /// Start a drift unconditionally. Used by tests and fault drills.
    pub fn begin_drift(&mut self, printer_id: &str, field: &str, direction: i8, duration: u32) {
        debug_assert!(duration > 0, "drift duration must be at least one cycle");
        self.drifts.insert(
            (printer_id.to_string(), field.to_string()),
            DriftState {
                direction,
                remaining: duration,
            },
        );
        self.stats.drifts_started += 1;
    }

    pub fn active_drift(&self, printer_id: &str, field: &str) -> Option<DriftState> {
        self.drifts
            .get(&(printer_id.to_string(), field.to_string()))
            .copied()
    }

    pub fn active_drift_count(&self) -> usize {
        self.drifts.len()
    }

    pub fn stats(&self) -> &AnomalyStats {
        &self.stats
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }
}
