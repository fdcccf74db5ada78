use crate::protocol::{PredictionResult, TelemetryRecord};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

// The trained artifact does not expose uncertainty, so confidence is a fixed
// placeholder, as is the anomaly score.
const TRAINED_CONFIDENCE: f64 = 0.95;
const TRAINED_ANOMALY_SCORE: f64 = 0.0;

/// Standardization parameters fitted offline alongside the regressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureScaler {
    fn transform(&self, features: &mut [f64]) {
        for (index, feature) in features.iter_mut().enumerate() {
            let std = self.std[index];
            *feature = if std == 0.0 {
                0.0
            } else {
                (*feature - self.mean[index]) / std
            };
        }
    }
}

/// Serialized training output: linear regressor, scaler, and the feature
/// order the vector must be built in. Produced by the offline training job;
/// consumed here read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub weights: Vec<f64>,
    pub intercept: f64,
    pub scaler: FeatureScaler,
    pub feature_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TrainedModel {
    artifact: ModelArtifact,
}

impl TrainedModel {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        let features = artifact.feature_names.len();
        if artifact.weights.len() != features
            || artifact.scaler.mean.len() != features
            || artifact.scaler.std.len() != features
        {
            return Err(ModelError::ShapeMismatch {
                features,
                weights: artifact.weights.len(),
                scaler: artifact.scaler.mean.len().min(artifact.scaler.std.len()),
            });
        }
        Ok(Self { artifact })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;
        Self::from_artifact(artifact)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.artifact.feature_names
    }

    fn predict(&self, record: &TelemetryRecord) -> PredictionResult {
        // Feature vector in the artifact's stored order; absent features
        // contribute 0.0.
        let mut features: Vec<f64> = self
            .artifact
            .feature_names
            .iter()
            .map(|name| record.number(name).unwrap_or(0.0))
            .collect();

        self.artifact.scaler.transform(&mut features);

        let predicted: f64 = features
            .iter()
            .zip(&self.artifact.weights)
            .map(|(feature, weight)| feature * weight)
            .sum::<f64>()
            + self.artifact.intercept;

        PredictionResult {
            predicted_roughness: predicted,
            confidence: TRAINED_CONFIDENCE,
            anomaly_score: TRAINED_ANOMALY_SCORE,
        }
    }
}

/// Stochastic stand-in used when no trained artifact is available.
#[derive(Debug, Clone, Default)]
pub struct FallbackModel;

impl FallbackModel {
    fn predict(&self, record: &TelemetryRecord) -> PredictionResult {
        let mut rng = rand::thread_rng();
        let roughness = record.roughness().unwrap_or(0.0);
        PredictionResult {
            predicted_roughness: roughness * rng.gen_range(0.9..1.1),
            confidence: rng.gen_range(0.7..0.95),
            anomaly_score: rng.gen_range(0.0..0.2),
        }
    }
}

/// Scoring function selected once at controller startup and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub enum RoughnessModel {
    Trained(TrainedModel),
    Fallback(FallbackModel),
}

impl RoughnessModel {
    pub fn predict(&self, record: &TelemetryRecord) -> PredictionResult {
        match self {
            RoughnessModel::Trained(model) => model.predict(record),
            RoughnessModel::Fallback(model) => model.predict(record),
        }
    }

    /// Load the trained artifact if a path is configured; any failure falls
    /// back to the stochastic model. This is a degraded condition, never a
    /// fatal one.
    pub fn load_or_fallback(path: Option<&Path>) -> Self {
        match path {
            Some(path) => match TrainedModel::load(path) {
                Ok(model) => {
                    info!(path = %path.display(), "loaded trained roughness model");
                    RoughnessModel::Trained(model)
                }
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "failed to load trained model, using fallback"
                    );
                    RoughnessModel::Fallback(FallbackModel)
                }
            },
            None => {
                info!("no model path configured, using fallback model");
                RoughnessModel::Fallback(FallbackModel)
            }
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            RoughnessModel::Trained(_) => "trained",
            RoughnessModel::Fallback(_) => "fallback",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("artifact shape mismatch: {features} features, {weights} weights, {scaler} scaler entries")]
    ShapeMismatch {
        features: usize,
        weights: usize,
        scaler: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            weights: vec![2.0, -1.0],
            intercept: 5.0,
            scaler: FeatureScaler {
                mean: vec![100.0, 200.0],
                std: vec![10.0, 20.0],
            },
            feature_names: vec!["print_speed".to_string(), "nozzle_temperature".to_string()],
        }
    }

    fn record() -> TelemetryRecord {
        let mut record = TelemetryRecord::new("printer_1");
        record.set_number("roughness", 40.0);
        record.set_number("print_speed", 120.0);
        record.set_number("nozzle_temperature", 240.0);
        record.set_number("bed_temperature", 70.0);
        record
    }

    #[test]
    fn test_trained_prediction_applies_scaler_and_weights() {
        let model = TrainedModel::from_artifact(artifact()).unwrap();
        let prediction = model.predict(&record());

        // scaled = [(120-100)/10, (240-200)/20] = [2, 2]; 2*2 + 2*(-1) + 5 = 7
        assert!((prediction.predicted_roughness - 7.0).abs() < 1e-9);
        assert!((prediction.confidence - 0.95).abs() < 1e-9);
        assert_eq!(prediction.anomaly_score, 0.0);
    }

    #[test]
    fn test_missing_feature_defaults_to_zero() {
        let model = TrainedModel::from_artifact(artifact()).unwrap();
        let mut sparse = record();
        sparse.fields.remove("nozzle_temperature");
        let prediction = model.predict(&sparse);

        // second feature: (0-200)/20 = -10; 2*2 + (-10)*(-1) + 5 = 19
        assert!((prediction.predicted_roughness - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_std_does_not_divide() {
        let mut degenerate = artifact();
        degenerate.scaler.std[0] = 0.0;
        let model = TrainedModel::from_artifact(degenerate).unwrap();
        let prediction = model.predict(&record());
        assert!(prediction.predicted_roughness.is_finite());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut bad = artifact();
        bad.weights.pop();
        assert!(matches!(
            TrainedModel::from_artifact(bad),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_fallback_prediction_ranges() {
        let model = RoughnessModel::Fallback(FallbackModel);
        for _ in 0..200 {
            let prediction = model.predict(&record());
            assert!(prediction.predicted_roughness >= 40.0 * 0.9);
            assert!(prediction.predicted_roughness <= 40.0 * 1.1);
            assert!(prediction.confidence >= 0.7 && prediction.confidence <= 0.95);
            assert!(prediction.anomaly_score >= 0.0 && prediction.anomaly_score <= 0.2);
        }
    }

    #[test]
    fn test_missing_path_selects_fallback() {
        let model = RoughnessModel::load_or_fallback(Some(Path::new("/nonexistent/model.json")));
        assert_eq!(model.variant_name(), "fallback");
    }
}
