use printbus::model::{ModelArtifact, RoughnessModel, TrainedModel};
use printbus::protocol::TelemetryRecord;
use std::io::Write;

fn artifact_json() -> String {
    serde_json::json!({
        "weights": [1.5, 0.5],
        "intercept": 10.0,
        "scaler": { "mean": [100.0, 200.0], "std": [10.0, 20.0] },
        "feature_names": ["print_speed", "nozzle_temperature"]
    })
    .to_string()
}

fn record() -> TelemetryRecord {
    let mut record = TelemetryRecord::new("printer_1");
    record.set_number("roughness", 30.0);
    record.set_number("print_speed", 110.0);
    record.set_number("nozzle_temperature", 220.0);
    record.set_number("bed_temperature", 70.0);
    record
}

#[test]
fn test_artifact_loads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(artifact_json().as_bytes()).unwrap();
    file.flush().unwrap();

    let model = RoughnessModel::load_or_fallback(Some(file.path()));
    assert_eq!(model.variant_name(), "trained");

    // scaled = [(110-100)/10, (220-200)/20] = [1, 1]; 1*1.5 + 1*0.5 + 10 = 12
    let prediction = model.predict(&record());
    assert!((prediction.predicted_roughness - 12.0).abs() < 1e-9);
    assert!((prediction.confidence - 0.95).abs() < 1e-9);
    assert_eq!(prediction.anomaly_score, 0.0);
}

#[test]
fn test_corrupt_artifact_falls_back() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"{ this is not an artifact }").unwrap();
    file.flush().unwrap();

    let model = RoughnessModel::load_or_fallback(Some(file.path()));
    assert_eq!(model.variant_name(), "fallback");
}

#[test]
fn test_shape_mismatch_falls_back() {
    let broken = serde_json::json!({
        "weights": [1.5],
        "intercept": 10.0,
        "scaler": { "mean": [100.0, 200.0], "std": [10.0, 20.0] },
        "feature_names": ["print_speed", "nozzle_temperature"]
    });
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(broken.to_string().as_bytes()).unwrap();
    file.flush().unwrap();

    let model = RoughnessModel::load_or_fallback(Some(file.path()));
    assert_eq!(model.variant_name(), "fallback");
}

#[test]
fn test_artifact_round_trip_preserves_shape() {
    let artifact: ModelArtifact = serde_json::from_str(&artifact_json()).unwrap();
    let model = TrainedModel::from_artifact(artifact.clone()).unwrap();
    assert_eq!(model.feature_names(), artifact.feature_names.as_slice());

    let reserialized = serde_json::to_string(&artifact).unwrap();
    let reparsed: ModelArtifact = serde_json::from_str(&reserialized).unwrap();
    assert_eq!(reparsed.weights, artifact.weights);
    assert_eq!(reparsed.feature_names, artifact.feature_names);
}

#[test]
fn test_fallback_scales_with_observed_roughness() {
    let model = RoughnessModel::load_or_fallback(None);
    assert_eq!(model.variant_name(), "fallback");

    for _ in 0..100 {
        let prediction = model.predict(&record());
        assert!(prediction.predicted_roughness >= 30.0 * 0.9);
        assert!(prediction.predicted_roughness <= 30.0 * 1.1);
        assert!((0.7..=0.95).contains(&prediction.confidence));
        assert!((0.0..=0.2).contains(&prediction.anomaly_score));
    }
}
