//! # Print-Fleet Closed-Loop Monitor
//!
//! A two-sided control system for a fleet of networked 3D printers:
//!
//! - **Controller**: subscribes to streaming sensor telemetry, persists it,
//!   scores surface roughness, and publishes corrective speed commands when
//!   the quality threshold is breached.
//! - **Plant simulator**: emits synthetic telemetry per device, injects
//!   transient anomalies (spikes, drifts), and folds received control
//!   commands back into device state, closing the loop.
//!
//! The two processes talk only through a lightweight pub/sub bus
//! (line-delimited JSON over TCP, wildcard topics, at-least-once delivery);
//! a minimal broker binary ships in-repo so the loop runs without external
//! services.
//!
//! ## Quick start
//!
//! ```no_run
//! use printbus::config::SimulatorConfig;
//! use printbus::simulator::PlantSimulator;
//!
//! let mut plant = PlantSimulator::new(SimulatorConfig::default());
//! let record = plant.generate_record("printer_1");
//! println!("{:?}", record.roughness());
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - wire types, topic scheme, validation
//! - [`bus`] / [`broker`] - pub/sub transport and the in-repo broker
//! - [`model`] - roughness scoring (trained artifact or stochastic fallback)
//! - [`anomaly`] - spike/drift perturbation engine
//! - [`simulator`] - per-device plant state machine
//! - [`controller`] - ingest → persist → score → decide → publish pipeline
//! - [`store`] - fire-and-forget time-series persistence client

#![allow(clippy::module_name_repetitions)]

pub mod anomaly;
pub mod broker;
pub mod bus;
pub mod config;
pub mod controller;
pub mod model;
pub mod protocol;
pub mod simulator;
pub mod store;

// Re-export the main public types for convenience
pub use bus::{BusClient, QoS};
pub use controller::Controller;
pub use model::RoughnessModel;
pub use protocol::{ControlCommand, TelemetryRecord};
pub use simulator::PlantSimulator;
