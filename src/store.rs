use crate::config::StoreConfig;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Measurement the controller writes telemetry under.
pub const TELEMETRY_MEASUREMENT: &str = "printing_metrics";

/// One time-series datapoint, encoded as InfluxDB line protocol on the way
/// out. The core never reads back.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ns: Option<i64>,
}

impl Point {
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns: None,
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn field(mut self, key: &str, value: f64) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn at(mut self, timestamp_ns: i64) -> Self {
        self.timestamp_ns = Some(timestamp_ns);
        self
    }

    /// Line-protocol rendering:
    /// `measurement,tag=value field=1.5,other=2 1700000000000000000`
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_identifier(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_identifier(key));
            line.push('=');
            line.push_str(&escape_identifier(value));
        }
        line.push(' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                line.push(',');
            }
            first = false;
            line.push_str(&escape_identifier(key));
            line.push('=');
            line.push_str(&format!("{}", value));
        }
        if let Some(timestamp) = self.timestamp_ns {
            line.push(' ');
            line.push_str(&timestamp.to_string());
        }
        line.push('\n');
        line
    }
}

fn escape_identifier(raw: &str) -> String {
    raw.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

/// Cloneable fire-and-forget writer handle. `write_point` never blocks the
/// caller; delivery problems are logged by the writer task.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Point>,
}

impl StoreHandle {
    pub fn write_point(&self, point: Point) {
        if self.tx.send(point).is_err() {
            warn!("store writer is gone, dropping point");
        }
    }
}

/// Connection to the time-series ingest socket. Initialization failure is
/// fatal to the caller; individual write failures after that are logged and
/// dropped.
#[derive(Debug)]
pub struct TimeSeriesStore {
    handle: StoreHandle,
    writer: JoinHandle<()>,
}

impl TimeSeriesStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let addr = config.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| StoreError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(addr = %addr, "connected to time-series store");

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(stream, rx));
        Ok(Self {
            handle: StoreHandle { tx },
            writer,
        })
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    /// Drop the internal sender and wait for the writer to drain.
    pub async fn shutdown(self) {
        let Self { handle, writer } = self;
        drop(handle);
        let _ = writer.await;
    }
}

async fn writer_task(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<Point>) {
    while let Some(point) = rx.recv().await {
        let line = point.to_line_protocol();
        if let Err(error) = stream.write_all(line.as_bytes()).await {
            // Availability of the control loop is prioritized over
            // durability of every datapoint.
            warn!(%error, "store write failed, dropping point");
        }
    }
    let _ = stream.shutdown().await;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
}
