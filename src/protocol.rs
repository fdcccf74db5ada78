use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_PAYLOAD_SIZE: usize = 4096;
pub const MAX_TOPIC_SIZE: usize = 128;

/// Telemetry is published per device; controllers subscribe with the wildcard.
pub const TELEMETRY_SUBSCRIPTION: &str = "printing/+/sensor";
/// Control commands are published per device; simulators subscribe with the wildcard.
pub const CONTROL_SUBSCRIPTION: &str = "printer/control/#";

pub fn telemetry_topic(printer_id: &str) -> String {
    format!("printing/{}/sensor", printer_id)
}

pub fn control_topic(printer_id: &str) -> String {
    format!("printer/control/{}", printer_id)
}

/// Match a topic against a subscription pattern. `+` matches exactly one
/// level, `#` matches every remaining level (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A single telemetry field: sensor values are numeric, annotations
/// (material names and the like) ride along as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(value) => Some(*value),
            FieldValue::Text(_) => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

/// One sensor reading from a printer. The named members are routing and
/// bookkeeping metadata; everything the sensors measured lives in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub printer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl TelemetryRecord {
    pub fn new(printer_id: &str) -> Self {
        Self {
            printer_id: printer_id.to_string(),
            timestamp: None,
            cycle_count: None,
            anomaly: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_number)
    }

    pub fn set_number(&mut self, name: &str, value: f64) {
        self.fields.insert(name.to_string(), FieldValue::Number(value));
    }

    pub fn roughness(&self) -> Option<f64> {
        self.number("roughness")
    }

    pub fn print_speed(&self) -> Option<f64> {
        self.number("print_speed")
    }

    pub fn nozzle_temperature(&self) -> Option<f64> {
        self.number("nozzle_temperature")
    }

    pub fn bed_temperature(&self) -> Option<f64> {
        self.number("bed_temperature")
    }

    /// Wire-level validation: routing identity plus the sensor fields every
    /// consumer depends on.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.printer_id.is_empty() {
            return Err(ProtocolError::EmptyPrinterId);
        }

        let roughness = self
            .roughness()
            .ok_or(ProtocolError::MissingField("roughness"))?;
        if !roughness.is_finite() || roughness < 0.0 {
            return Err(ProtocolError::FieldOutOfRange {
                field: "roughness",
                value: roughness,
            });
        }

        let print_speed = self
            .print_speed()
            .ok_or(ProtocolError::MissingField("print_speed"))?;
        if !print_speed.is_finite() || print_speed <= 0.0 {
            return Err(ProtocolError::FieldOutOfRange {
                field: "print_speed",
                value: print_speed,
            });
        }

        if self.nozzle_temperature().is_none() {
            return Err(ProtocolError::MissingField("nozzle_temperature"));
        }
        if self.bed_temperature().is_none() {
            return Err(ProtocolError::MissingField("bed_temperature"));
        }

        Ok(())
    }
}

/// Model output attached to every control command. Produced fresh per
/// telemetry record, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_roughness: f64,
    pub confidence: f64,
    pub anomaly_score: f64,
}

/// Corrective instruction sent back to a device: a new target print speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub printer_id: String,
    pub timestamp: String,
    pub original_speed: f64,
    pub new_speed: f64,
    pub reason: String,
    pub prediction: PredictionResult,
}

impl ControlCommand {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.printer_id.is_empty() {
            return Err(ProtocolError::EmptyPrinterId);
        }
        if !self.new_speed.is_finite() || self.new_speed <= 0.0 {
            return Err(ProtocolError::FieldOutOfRange {
                field: "new_speed",
                value: self.new_speed,
            });
        }
        if !self.original_speed.is_finite() || self.original_speed <= 0.0 {
            return Err(ProtocolError::FieldOutOfRange {
                field: "original_speed",
                value: self.original_speed,
            });
        }
        Ok(())
    }

    /// Scalar view of the command, keyed the way it appears on the wire.
    /// The simulator overwrites any telemetry field whose name matches one
    /// of these keys when folding feedback into the next record.
    pub fn field_overrides(&self) -> BTreeMap<String, FieldValue> {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "printer_id".to_string(),
            FieldValue::Text(self.printer_id.clone()),
        );
        overrides.insert(
            "timestamp".to_string(),
            FieldValue::Text(self.timestamp.clone()),
        );
        overrides.insert(
            "original_speed".to_string(),
            FieldValue::Number(self.original_speed),
        );
        overrides.insert("new_speed".to_string(), FieldValue::Number(self.new_speed));
        overrides.insert("reason".to_string(), FieldValue::Text(self.reason.clone()));
        overrides
    }
}

pub fn encode_telemetry(record: &TelemetryRecord) -> Result<String, ProtocolError> {
    let payload = serde_json::to_string(record)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    Ok(payload)
}

pub fn decode_telemetry(payload: &str) -> Result<TelemetryRecord, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let record: TelemetryRecord = serde_json::from_str(payload)?;
    record.validate()?;
    Ok(record)
}

pub fn encode_command(command: &ControlCommand) -> Result<String, ProtocolError> {
    let payload = serde_json::to_string(command)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    Ok(payload)
}

pub fn decode_command(payload: &str) -> Result<ControlCommand, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let command: ControlCommand = serde_json::from_str(payload)?;
    command.validate()?;
    Ok(command)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload size {0} exceeds {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: f64 },
    #[error("printer_id must be non-empty")]
    EmptyPrinterId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_construction() {
        assert_eq!(telemetry_topic("printer_1"), "printing/printer_1/sensor");
        assert_eq!(control_topic("printer_1"), "printer/control/printer_1");
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("printing/+/sensor", "printing/printer_1/sensor"));
        assert!(topic_matches("printing/+/sensor", "printing/printer_42/sensor"));
        assert!(!topic_matches("printing/+/sensor", "printing/printer_1/status"));
        assert!(!topic_matches("printing/+/sensor", "printing/a/b/sensor"));
        assert!(!topic_matches("printing/+/sensor", "printing/sensor"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("printer/control/#", "printer/control/printer_1"));
        assert!(topic_matches("printer/control/#", "printer/control/a/b/c"));
        assert!(topic_matches("printer/control/#", "printer/control"));
        assert!(!topic_matches("printer/control/#", "printer/status/printer_1"));
    }

    #[test]
    fn test_exact_topic_match() {
        assert!(topic_matches(
            "printing/printer_1/sensor",
            "printing/printer_1/sensor"
        ));
        assert!(!topic_matches(
            "printing/printer_1/sensor",
            "printing/printer_2/sensor"
        ));
    }

    #[test]
    fn test_validation_rejects_missing_fields() {
        let mut record = TelemetryRecord::new("printer_1");
        record.set_number("roughness", 25.0);
        record.set_number("print_speed", 100.0);
        record.set_number("nozzle_temperature", 220.0);

        assert!(matches!(
            record.validate(),
            Err(ProtocolError::MissingField("bed_temperature"))
        ));

        record.set_number("bed_temperature", 70.0);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut record = TelemetryRecord::new("printer_1");
        record.set_number("roughness", -1.0);
        record.set_number("print_speed", 100.0);
        record.set_number("nozzle_temperature", 220.0);
        record.set_number("bed_temperature", 70.0);
        assert!(record.validate().is_err());

        record.set_number("roughness", 25.0);
        record.set_number("print_speed", 0.0);
        assert!(record.validate().is_err());

        let empty_id = TelemetryRecord::new("");
        assert!(matches!(
            empty_id.validate(),
            Err(ProtocolError::EmptyPrinterId)
        ));
    }

    #[test]
    fn test_text_fields_survive_the_wire() {
        let mut record = TelemetryRecord::new("printer_1");
        record.set_number("roughness", 25.0);
        record.set_number("print_speed", 100.0);
        record.set_number("nozzle_temperature", 220.0);
        record.set_number("bed_temperature", 70.0);
        record
            .fields
            .insert("material".to_string(), FieldValue::from("pla"));

        let payload = encode_telemetry(&record).unwrap();
        let decoded = decode_telemetry(&payload).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.fields.get("material"),
            Some(&FieldValue::Text("pla".to_string()))
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut record = TelemetryRecord::new("printer_1");
        record.set_number("roughness", 25.0);
        record.set_number("print_speed", 100.0);
        record.set_number("nozzle_temperature", 220.0);
        record.set_number("bed_temperature", 70.0);
        for index in 0..500 {
            record.set_number(&format!("padding_field_{}", index), index as f64);
        }
        assert!(matches!(
            encode_telemetry(&record),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
