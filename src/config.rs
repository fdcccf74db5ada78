use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BUS_HOST: &str = "127.0.0.1";
pub const DEFAULT_BUS_PORT: u16 = 1883;

// Bounded-retry connect policy: exhausting the attempts is fatal.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_RETRY_DELAY_S: u64 = 5;

pub const DEFAULT_ROUGHNESS_THRESHOLD: f64 = 75.0;
pub const DEFAULT_ADJUSTMENT_FACTOR: f64 = 0.8;
pub const DEFAULT_FLOOR_SPEED: f64 = 10.0;

pub const DEFAULT_PRINTER_COUNT: u32 = 3;
pub const DEFAULT_BASE_RATE_HZ: f64 = 100.0;
pub const DEFAULT_JITTER_FRACTION: f64 = 0.05;

pub const DEFAULT_SPIKE_PROBABILITY: f64 = 0.05;
pub const DEFAULT_SPIKE_MAGNITUDE: f64 = 3.0;
pub const DEFAULT_DRIFT_START_PROBABILITY: f64 = 0.03;
pub const DEFAULT_DRIFT_STEP: f64 = 0.02;
pub const DEFAULT_DRIFT_MIN_CYCLES: u32 = 10;
pub const DEFAULT_DRIFT_MAX_CYCLES: u32 = 30;

pub const DEFAULT_STORE_HOST: &str = "127.0.0.1";
pub const DEFAULT_STORE_PORT: u16 = 8094;

const USERNAME_ENV: &str = "PRINTBUS_USERNAME";
const PASSWORD_ENV: &str = "PRINTBUS_PASSWORD";

/// Connection settings for the message bus. Built once at startup and handed
/// to the bus client by value; nothing reads the environment after that.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl BusConfig {
    pub fn new(host: &str, port: u16, client_id: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
            username: std::env::var(USERNAME_ENV).ok(),
            password: std::env::var(PASSWORD_ENV).ok(),
            max_connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_delay: Duration::from_secs(DEFAULT_CONNECT_RETRY_DELAY_S),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Perturbation tuning for the anomaly injector.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub spike_probability: f64,
    pub spike_magnitude: f64,
    pub drift_start_probability: f64,
    pub drift_step: f64,
    pub drift_min_cycles: u32,
    pub drift_max_cycles: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            spike_probability: DEFAULT_SPIKE_PROBABILITY,
            spike_magnitude: DEFAULT_SPIKE_MAGNITUDE,
            drift_start_probability: DEFAULT_DRIFT_START_PROBABILITY,
            drift_step: DEFAULT_DRIFT_STEP,
            drift_min_cycles: DEFAULT_DRIFT_MIN_CYCLES,
            drift_max_cycles: DEFAULT_DRIFT_MAX_CYCLES,
        }
    }
}

/// Plant simulator settings: fleet size, generation rate, dataset seeding,
/// and whether control feedback is folded back into device state.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub printer_count: u32,
    pub base_rate_hz: f64,
    pub jitter_fraction: f64,
    pub dataset_path: Option<PathBuf>,
    pub feedback_enabled: bool,
    pub anomaly: AnomalyConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            printer_count: DEFAULT_PRINTER_COUNT,
            base_rate_hz: DEFAULT_BASE_RATE_HZ,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            dataset_path: None,
            feedback_enabled: true,
            anomaly: AnomalyConfig::default(),
        }
    }
}

/// Controller decision parameters, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub roughness_threshold: f64,
    pub adjustment_factor: f64,
    pub floor_speed: f64,
    pub model_path: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            roughness_threshold: DEFAULT_ROUGHNESS_THRESHOLD,
            adjustment_factor: DEFAULT_ADJUSTMENT_FACTOR,
            floor_speed: DEFAULT_FLOOR_SPEED,
            model_path: None,
        }
    }
}

/// Time-series store endpoint (a line-protocol ingest socket).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_STORE_HOST.to_string(),
            port: DEFAULT_STORE_PORT,
        }
    }
}

impl StoreConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
