use printbus::config::ControllerConfig;
use printbus::controller::{format_threshold, plan_adjustment, telemetry_point};
use printbus::protocol::{
    decode_command, encode_command, PredictionResult, TelemetryRecord,
};

fn record(roughness: f64, print_speed: f64) -> TelemetryRecord {
    let mut record = TelemetryRecord::new("printer_1");
    record.set_number("roughness", roughness);
    record.set_number("print_speed", print_speed);
    record.set_number("nozzle_temperature", 220.0);
    record.set_number("bed_temperature", 70.0);
    record
}

fn prediction() -> PredictionResult {
    PredictionResult {
        predicted_roughness: 78.0,
        confidence: 0.95,
        anomaly_score: 0.0,
    }
}

fn config() -> ControllerConfig {
    ControllerConfig::default()
}

#[test]
fn test_no_command_at_or_below_threshold() {
    // roughness 50 with threshold 75: quality is acceptable, no correction.
    assert!(plan_adjustment(&record(50.0, 100.0), &prediction(), &config()).is_none());

    // Exactly at the threshold is still acceptable; only a breach corrects.
    assert!(plan_adjustment(&record(75.0, 100.0), &prediction(), &config()).is_none());
}

#[test]
fn test_breach_produces_proportional_command() {
    let command = plan_adjustment(&record(80.0, 100.0), &prediction(), &config())
        .expect("breach must produce a command");

    assert_eq!(command.printer_id, "printer_1");
    assert_eq!(command.original_speed, 100.0);
    assert_eq!(command.new_speed, 80.0);
    assert_eq!(command.reason, "roughness_threshold_exceeded_75");
    assert_eq!(command.prediction, prediction());
    assert!(command.validate().is_ok());
}

#[test]
fn test_floor_binds_at_low_speeds() {
    // 5 * 0.8 = 4 would undercut the hard floor; the floor wins.
    let command = plan_adjustment(&record(80.0, 5.0), &prediction(), &config())
        .expect("breach must produce a command");
    assert_eq!(command.new_speed, 10.0);
    assert_eq!(command.original_speed, 5.0);
}

#[test]
fn test_fractional_threshold_appears_in_reason() {
    let config = ControllerConfig {
        roughness_threshold: 72.5,
        ..ControllerConfig::default()
    };
    let command = plan_adjustment(&record(80.0, 100.0), &prediction(), &config)
        .expect("breach must produce a command");
    assert_eq!(command.reason, "roughness_threshold_exceeded_72.5");
}

#[test]
fn test_every_breach_yields_exactly_one_command() {
    for roughness in [76.0, 90.0, 150.0, 75.01] {
        let planned = plan_adjustment(&record(roughness, 100.0), &prediction(), &config());
        assert!(planned.is_some(), "roughness {} must correct", roughness);
    }
    for roughness in [0.0, 20.0, 74.99, 75.0] {
        let planned = plan_adjustment(&record(roughness, 100.0), &prediction(), &config());
        assert!(planned.is_none(), "roughness {} must not correct", roughness);
    }
}

#[test]
fn test_command_round_trip() {
    let command = plan_adjustment(&record(80.0, 100.0), &prediction(), &config()).unwrap();
    let payload = encode_command(&command).unwrap();
    let decoded = decode_command(&payload).unwrap();
    assert_eq!(decoded, command);
}

#[test]
fn test_threshold_rendering() {
    assert_eq!(format_threshold(75.0), "75");
    assert_eq!(format_threshold(80.25), "80.25");
}

#[test]
fn test_persisted_point_shape() {
    let point = telemetry_point(&record(82.5, 100.0));
    let line = point.to_line_protocol();
    assert!(line.starts_with("printing_metrics,printer_id=printer_1 "));
    assert!(line.contains("roughness=82.5"));
    assert!(line.contains("temperature=220"));
}
