use crate::bus::{BusClient, BusConnection, BusError, QoS, Subscription};
use crate::config::{BusConfig, ControllerConfig, StoreConfig};
use crate::model::RoughnessModel;
use crate::protocol::{
    control_topic, decode_telemetry, encode_command, ControlCommand, PredictionResult,
    TelemetryRecord, TELEMETRY_SUBSCRIPTION,
};
use crate::store::{Point, StoreError, StoreHandle, TimeSeriesStore, TELEMETRY_MEASUREMENT};
use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Startup progression. Bus connect failure after bounded retries and store
/// initialization failure are fatal; everything after `Running` degrades
/// instead of halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Connecting,
    Subscribed,
    Running,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerStats {
    pub messages_processed: u64,
    pub decode_failures: u64,
    pub points_persisted: u64,
    pub commands_published: u64,
}

/// Real-time controller: one telemetry message in, at most one control
/// command out.
#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    model: RoughnessModel,
    store: StoreHandle,
    bus: BusClient,
    phase: ControllerPhase,
    stats: ControllerStats,
}

/// Everything `start` wires up; the binary keeps the connection and store
/// around for orderly shutdown.
#[derive(Debug)]
pub struct ControllerRuntime {
    pub controller: Controller,
    pub telemetry: Subscription,
    pub bus: BusConnection,
    pub store: TimeSeriesStore,
}

/// Startup sequence: connect bus (bounded retry, fatal), init store (fatal),
/// load model (degrades to fallback), subscribe to the telemetry wildcard.
pub async fn start(
    bus_config: &BusConfig,
    store_config: &StoreConfig,
    config: ControllerConfig,
) -> Result<ControllerRuntime, ControllerStartupError> {
    info!(phase = "connecting", "controller starting");
    let bus = BusClient::connect(bus_config).await?;
    let store = TimeSeriesStore::connect(store_config).await?;
    let model = RoughnessModel::load_or_fallback(config.model_path.as_deref());
    info!(model = model.variant_name(), "scoring model selected");

    let telemetry = bus.client.subscribe(TELEMETRY_SUBSCRIPTION)?;
    info!(phase = "subscribed", pattern = TELEMETRY_SUBSCRIPTION, "telemetry subscription active");

    let controller = Controller::new(config, model, store.handle(), bus.client.clone());
    Ok(ControllerRuntime {
        controller,
        telemetry,
        bus,
        store,
    })
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        model: RoughnessModel,
        store: StoreHandle,
        bus: BusClient,
    ) -> Self {
        Self {
            config,
            model,
            store,
            bus,
            phase: ControllerPhase::Subscribed,
            stats: ControllerStats::default(),
        }
    }

    /// Single-threaded event loop: each message is handled to completion
    /// before the next is dispatched. Ends when the subscription closes.
    pub async fn run(&mut self, mut telemetry: Subscription) {
        self.phase = ControllerPhase::Running;
        info!(
            phase = "running",
            threshold = self.config.roughness_threshold,
            adjustment_factor = self.config.adjustment_factor,
            floor_speed = self.config.floor_speed,
            "controller event loop started"
        );
        while let Some(message) = telemetry.next().await {
            self.handle_payload(&message.payload);
        }
        info!("telemetry stream ended, controller stopping");
    }

    /// Pipeline for one delivered message: decode, persist, score, decide.
    /// A failure in one step never crashes the loop; decode failures drop
    /// the message (bus redelivery is the retry mechanism).
    pub fn handle_payload(&mut self, payload: &str) {
        self.stats.messages_processed += 1;

        let record = match decode_telemetry(payload) {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "dropping malformed telemetry payload");
                self.stats.decode_failures += 1;
                return;
            }
        };

        self.store.write_point(telemetry_point(&record));
        self.stats.points_persisted += 1;

        let prediction = self.model.predict(&record);
        debug!(
            printer_id = %record.printer_id,
            predicted = prediction.predicted_roughness,
            confidence = prediction.confidence,
            "scored telemetry record"
        );

        if let Some(command) = plan_adjustment(&record, &prediction, &self.config) {
            match encode_command(&command) {
                Ok(encoded) => {
                    let topic = control_topic(&command.printer_id);
                    if let Err(error) = self.bus.publish(&topic, &encoded, QoS::AtLeastOnce) {
                        warn!(%error, "failed to publish control command");
                    } else {
                        info!(
                            printer_id = %command.printer_id,
                            original_speed = command.original_speed,
                            new_speed = command.new_speed,
                            "published speed adjustment"
                        );
                        self.stats.commands_published += 1;
                    }
                }
                Err(error) => {
                    warn!(%error, "failed to encode control command");
                }
            }
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}

/// Decide whether a record warrants a corrective command. Pure in the
/// configuration and record; the returned speed never drops below the
/// configured floor.
pub fn plan_adjustment(
    record: &TelemetryRecord,
    prediction: &PredictionResult,
    config: &ControllerConfig,
) -> Option<ControlCommand> {
    let roughness = record.roughness()?;
    if roughness <= config.roughness_threshold {
        return None;
    }
    let original_speed = record.print_speed()?;
    let new_speed = (original_speed * config.adjustment_factor).max(config.floor_speed);

    Some(ControlCommand {
        printer_id: record.printer_id.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        original_speed,
        new_speed,
        reason: format!(
            "roughness_threshold_exceeded_{}",
            format_threshold(config.roughness_threshold)
        ),
        prediction: prediction.clone(),
    })
}

/// Datapoint persisted for every accepted record: roughness and nozzle
/// temperature, tagged by device.
pub fn telemetry_point(record: &TelemetryRecord) -> Point {
    Point::new(TELEMETRY_MEASUREMENT)
        .tag("printer_id", &record.printer_id)
        .field("roughness", record.roughness().unwrap_or(0.0))
        .field(
            "temperature",
            record.nozzle_temperature().unwrap_or(0.0),
        )
        .at(Utc::now().timestamp_nanos_opt().unwrap_or(0))
}

/// Integral thresholds render without a decimal point, so a threshold of
/// 75.0 produces `roughness_threshold_exceeded_75`.
pub fn format_threshold(threshold: f64) -> String {
    if threshold.fract() == 0.0 && threshold.abs() < 1e15 {
        format!("{}", threshold as i64)
    } else {
        format!("{}", threshold)
    }
}

#[derive(Debug, Error)]
pub enum ControllerStartupError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_formatting() {
        assert_eq!(format_threshold(75.0), "75");
        assert_eq!(format_threshold(75.5), "75.5");
        assert_eq!(format_threshold(0.0), "0");
    }
}
