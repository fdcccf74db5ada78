use crate::anomaly::{AnomalyInjector, AnomalyStats};
use crate::config::SimulatorConfig;
use crate::protocol::{ControlCommand, FieldValue, TelemetryRecord};
use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

/// Fields the injector targets each cycle. The injector itself is
/// field-parameterized; these are just the defaults the plant wires up.
pub const SPIKE_FIELD: &str = "nozzle_temperature";
pub const DRIFT_FIELD: &str = "bed_temperature";

pub fn printer_id(index: u32) -> String {
    format!("printer_{}", index)
}

/// Simulator-owned state for one device. Created lazily on the first
/// generation cycle, lives for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceSimState {
    pub base_params: BTreeMap<String, FieldValue>,
    pub last_adjustment: Option<ControlCommand>,
    pub cycle_count: u64,
}

/// Synthetic plant for the printer fleet.
///
/// Owns every `DeviceSimState`. Callers that drive generation and feedback
/// from different tasks must share the simulator behind a lock so each
/// cycle sees feedback either fully applied or not at all.
#[derive(Debug)]
pub struct PlantSimulator {
    config: SimulatorConfig,
    dataset: Vec<BTreeMap<String, FieldValue>>,
    devices: HashMap<String, DeviceSimState>,
    injector: AnomalyInjector,
    rng: StdRng,
}

impl PlantSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_seed(config, rand::random())
    }

    /// Fixed seed for deterministic behavior in tests.
    pub fn with_seed(config: SimulatorConfig, seed: u64) -> Self {
        let dataset = load_reference_dataset(config.dataset_path.as_deref());
        let injector = AnomalyInjector::with_seed(config.anomaly.clone(), seed.wrapping_add(1));
        Self {
            config,
            dataset,
            devices: HashMap::new(),
            injector,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run one generation cycle for a device and return the record to
    /// publish. First call for a device seeds its base parameters from a
    /// random reference row.
    pub fn generate_record(&mut self, printer_id: &str) -> TelemetryRecord {
        if !self.devices.contains_key(printer_id) {
            let row = self.dataset[self.rng.gen_range(0..self.dataset.len())].clone();
            info!(printer_id = %printer_id, "seeded device state from reference dataset");
            self.devices.insert(
                printer_id.to_string(),
                DeviceSimState {
                    base_params: row,
                    last_adjustment: None,
                    cycle_count: 0,
                },
            );
        }

        let state = &self.devices[printer_id];
        let mut record = TelemetryRecord::new(printer_id);
        record.fields = state.base_params.clone();
        let overrides = state
            .last_adjustment
            .as_ref()
            .map(ControlCommand::field_overrides);

        // Independent ±jitter on every numeric field, rounded to 2 decimals.
        let low = 1.0 - self.config.jitter_fraction;
        let high = 1.0 + self.config.jitter_fraction;
        for value in record.fields.values_mut() {
            if let FieldValue::Number(number) = value {
                let jittered = *number * self.rng.gen_range(low..=high);
                *value = FieldValue::Number((jittered * 100.0).round() / 100.0);
            }
        }

        self.injector.inject_spike(&mut record, SPIKE_FIELD);
        self.injector.inject_drift(&mut record, DRIFT_FIELD);

        // Feedback override: fields named in the last command win over
        // jitter and anomalies.
        if let Some(overrides) = overrides {
            for (name, value) in overrides {
                if record.fields.contains_key(&name) {
                    record.fields.insert(name, value);
                }
            }
        }

        let state = self.devices.get_mut(printer_id).expect("state just seeded");
        record.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
        record.cycle_count = Some(state.cycle_count);
        state.cycle_count += 1;

        record
    }

    /// Fold a control command into the matching device's state. The next
    /// generation cycle for that device picks it up.
    pub fn apply_feedback(&mut self, command: ControlCommand) {
        match self.devices.get_mut(&command.printer_id) {
            Some(state) => {
                info!(
                    printer_id = %command.printer_id,
                    new_speed = command.new_speed,
                    reason = %command.reason,
                    "applied feedback adjustment"
                );
                state.last_adjustment = Some(command);
            }
            None => {
                // The fleet generates every tick, so this only happens for
                // commands addressed outside the configured device set.
                warn!(
                    printer_id = %command.printer_id,
                    "dropping feedback for unknown device"
                );
            }
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_state(&self, printer_id: &str) -> Option<&DeviceSimState> {
        self.devices.get(printer_id)
    }

    pub fn anomaly_stats(&self) -> &AnomalyStats {
        self.injector.stats()
    }

    /// Test hook: force a drift so override-vs-anomaly interactions can be
    /// exercised deterministically.
    pub fn injector_mut(&mut self) -> &mut AnomalyInjector {
        &mut self.injector
    }
}

/// Minimal row used when no reference dataset can be loaded; carries the
/// full required telemetry field set so generated records always validate.
fn fallback_row() -> BTreeMap<String, FieldValue> {
    let mut row = BTreeMap::new();
    row.insert("layer_height".to_string(), FieldValue::Number(2.0));
    row.insert("wall_thickness".to_string(), FieldValue::Number(8.0));
    row.insert("roughness".to_string(), FieldValue::Number(25.0));
    row.insert("print_speed".to_string(), FieldValue::Number(60.0));
    row.insert("nozzle_temperature".to_string(), FieldValue::Number(220.0));
    row.insert("bed_temperature".to_string(), FieldValue::Number(70.0));
    row
}

fn load_reference_dataset(path: Option<&Path>) -> Vec<BTreeMap<String, FieldValue>> {
    let Some(path) = path else {
        info!("no reference dataset configured, using built-in fallback row");
        return vec![fallback_row()];
    };

    match read_dataset(path) {
        Ok(rows) if !rows.is_empty() => {
            info!(path = %path.display(), rows = rows.len(), "loaded reference dataset");
            rows
        }
        Ok(_) => {
            warn!(path = %path.display(), "reference dataset is empty, using fallback row");
            vec![fallback_row()]
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to load reference dataset, using fallback row");
            vec![fallback_row()]
        }
    }
}

fn read_dataset(path: &Path) -> Result<Vec<BTreeMap<String, FieldValue>>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut row = BTreeMap::new();
        for (header, raw) in headers.iter().zip(record.iter()) {
            let value = match raw.parse::<f64>() {
                Ok(number) => FieldValue::Number(number),
                Err(_) => FieldValue::Text(raw.to_string()),
            };
            row.insert(header.to_string(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}
