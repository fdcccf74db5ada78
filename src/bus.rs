use crate::config::BusConfig;
use crate::protocol::{topic_matches, MAX_TOPIC_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(3);
const RETRANSMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_PUBLISH_RETRIES: u32 = 3;

/// Delivery guarantee for a publish. Level 1 is at-least-once: the broker
/// acks the packet and unacked publishes are retransmitted, so subscribers
/// may see duplicates and handlers must tolerate them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Line-delimited JSON frames exchanged with the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
    },
    ConnAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Subscribe {
        pattern: String,
    },
    Publish {
        #[serde(skip_serializing_if = "Option::is_none")]
        packet_id: Option<u64>,
        topic: String,
        payload: String,
        qos: u8,
    },
    PubAck {
        packet_id: u64,
    },
    Message {
        topic: String,
        payload: String,
    },
    Disconnect,
}

impl Frame {
    pub fn encode(&self) -> String {
        let mut line = serde_json::to_string(self).expect("frame serialization is infallible");
        line.push('\n');
        line
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

/// Stream of messages matching one subscription pattern. Ends when the bus
/// connection closes.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

/// Retransmit bookkeeping for QoS-1 publishes: unacked packets are resent
/// after an ack timeout, a bounded number of times.
#[derive(Debug)]
pub struct RetryQueue {
    pending: HashMap<u64, PendingPublish>,
    next_packet_id: u64,
    ack_timeout: Duration,
    max_retries: u32,
}

#[derive(Debug)]
struct PendingPublish {
    topic: String,
    payload: String,
    last_sent: Instant,
    retries: u32,
}

impl RetryQueue {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            next_packet_id: 0,
            ack_timeout,
            max_retries,
        }
    }

    /// Track a new QoS-1 publish and hand back its packet id.
    pub fn register(&mut self, topic: &str, payload: &str, now: Instant) -> u64 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        let packet_id = self.next_packet_id;
        self.pending.insert(
            packet_id,
            PendingPublish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                last_sent: now,
                retries: 0,
            },
        );
        packet_id
    }

    /// Broker acked the packet; returns false for unknown (already acked
    /// or expired) ids.
    pub fn acknowledge(&mut self, packet_id: u64) -> bool {
        self.pending.remove(&packet_id).is_some()
    }

    /// Packets whose ack window has elapsed. Each returned entry has its
    /// retry counter bumped; entries over the retry budget are dropped
    /// instead of returned.
    pub fn due(&mut self, now: Instant) -> Vec<(u64, String, String)> {
        let ack_timeout = self.ack_timeout;
        let max_retries = self.max_retries;

        let mut expired = Vec::new();
        let mut ready = Vec::new();
        for (&packet_id, pending) in &mut self.pending {
            if now.duration_since(pending.last_sent) < ack_timeout {
                continue;
            }
            if pending.retries >= max_retries {
                expired.push(packet_id);
                continue;
            }
            pending.retries += 1;
            pending.last_sent = now;
            ready.push((packet_id, pending.topic.clone(), pending.payload.clone()));
        }
        for packet_id in expired {
            warn!(packet_id, "dropping publish after exhausting retransmits");
            self.pending.remove(&packet_id);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

enum ClientOp {
    Subscribe {
        pattern: String,
        sender: mpsc::UnboundedSender<BusMessage>,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
    },
    Disconnect,
}

/// Pub/sub client handle. Cheap to clone; all I/O runs on a background task
/// that owns the socket.
#[derive(Debug, Clone)]
pub struct BusClient {
    op_tx: mpsc::UnboundedSender<ClientOp>,
}

impl std::fmt::Debug for ClientOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientOp::Subscribe { pattern, .. } => write!(f, "Subscribe({})", pattern),
            ClientOp::Publish { topic, .. } => write!(f, "Publish({})", topic),
            ClientOp::Disconnect => write!(f, "Disconnect"),
        }
    }
}

/// Client plus the handle of its I/O task, returned by `connect`. Keep the
/// runner around to await orderly shutdown.
#[derive(Debug)]
pub struct BusConnection {
    pub client: BusClient,
    runner: JoinHandle<()>,
}

impl BusConnection {
    /// Ask the I/O task to send `Disconnect` and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.client.op_tx.send(ClientOp::Disconnect);
        let _ = self.runner.await;
    }
}

impl BusClient {
    /// Connect with bounded retry. Exhausting the attempts (or a rejected
    /// handshake) is fatal and surfaces to the caller.
    pub async fn connect(config: &BusConfig) -> Result<BusConnection, BusError> {
        let addr = config.addr();
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(&addr).await {
                Ok(stream) => break stream,
                Err(source) => {
                    if attempt >= config.max_connect_attempts {
                        return Err(BusError::ConnectExhausted {
                            addr,
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(
                        addr = %addr,
                        attempt,
                        max = config.max_connect_attempts,
                        "bus connection attempt failed, retrying"
                    );
                    time::sleep(config.connect_retry_delay).await;
                }
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let connect = Frame::Connect {
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        write_half.write_all(connect.encode().as_bytes()).await?;

        let mut line = String::new();
        let ack = time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| BusError::HandshakeTimeout)??;
        if ack == 0 {
            return Err(BusError::Closed);
        }
        match serde_json::from_str::<Frame>(line.trim())? {
            Frame::ConnAck { ok: true, .. } => {}
            Frame::ConnAck { ok: false, error } => {
                return Err(BusError::ConnectionRejected(
                    error.unwrap_or_else(|| "unspecified".to_string()),
                ));
            }
            other => {
                return Err(BusError::ConnectionRejected(format!(
                    "unexpected handshake frame: {:?}",
                    other
                )));
            }
        }
        info!(addr = %addr, client_id = %config.client_id, "connected to bus");

        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(io_task(reader, write_half, op_rx));

        Ok(BusConnection {
            client: BusClient { op_tx },
            runner,
        })
    }

    /// Register a wildcard subscription and return its message stream.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        if pattern.len() > MAX_TOPIC_SIZE {
            return Err(BusError::TopicTooLong(pattern.len()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.op_tx
            .send(ClientOp::Subscribe {
                pattern: pattern.to_string(),
                sender,
            })
            .map_err(|_| BusError::Closed)?;
        Ok(Subscription { receiver })
    }

    /// Fire-and-forget publish at the chosen QoS.
    pub fn publish(&self, topic: &str, payload: &str, qos: QoS) -> Result<(), BusError> {
        if topic.len() > MAX_TOPIC_SIZE {
            return Err(BusError::TopicTooLong(topic.len()));
        }
        self.op_tx
            .send(ClientOp::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
                qos,
            })
            .map_err(|_| BusError::Closed)
    }
}

/// Reads frames off the socket on its own task; `select!` in the I/O task
/// then only ever races channel receives, which are cancellation-safe.
async fn frame_reader(
    mut reader: BufReader<OwnedReadHalf>,
    frame_tx: mpsc::UnboundedSender<Frame>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Frame>(trimmed) {
                    Ok(frame) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "dropping malformed frame from broker");
                    }
                }
            }
            Err(error) => {
                warn!(%error, "bus read failed");
                break;
            }
        }
    }
}

async fn io_task(
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    mut op_rx: mpsc::UnboundedReceiver<ClientOp>,
) {
    let mut subscriptions: Vec<(String, mpsc::UnboundedSender<BusMessage>)> = Vec::new();
    let mut retry_queue = RetryQueue::new(ACK_TIMEOUT, MAX_PUBLISH_RETRIES);
    let mut sweep = time::interval(RETRANSMIT_SWEEP_INTERVAL);

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(frame_reader(reader, frame_tx));

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(Frame::Message { topic, payload }) => {
                        subscriptions.retain(|(pattern, sender)| {
                            if !topic_matches(pattern, &topic) {
                                return true;
                            }
                            sender
                                .send(BusMessage {
                                    topic: topic.clone(),
                                    payload: payload.clone(),
                                })
                                .is_ok()
                        });
                    }
                    Some(Frame::PubAck { packet_id }) => {
                        if !retry_queue.acknowledge(packet_id) {
                            debug!(packet_id, "ack for unknown packet");
                        }
                    }
                    Some(other) => {
                        debug!(frame = ?other, "ignoring unexpected frame");
                    }
                    None => {
                        warn!("bus connection closed by broker");
                        break;
                    }
                }
            }
            op = op_rx.recv() => {
                match op {
                    Some(ClientOp::Subscribe { pattern, sender }) => {
                        let frame = Frame::Subscribe { pattern: pattern.clone() };
                        if let Err(error) = writer.write_all(frame.encode().as_bytes()).await {
                            warn!(%error, "failed to send subscribe");
                            break;
                        }
                        subscriptions.push((pattern, sender));
                    }
                    Some(ClientOp::Publish { topic, payload, qos }) => {
                        let packet_id = match qos {
                            QoS::AtLeastOnce => {
                                Some(retry_queue.register(&topic, &payload, Instant::now()))
                            }
                            QoS::AtMostOnce => None,
                        };
                        let frame = Frame::Publish {
                            packet_id,
                            topic,
                            payload,
                            qos: match qos {
                                QoS::AtMostOnce => 0,
                                QoS::AtLeastOnce => 1,
                            },
                        };
                        if let Err(error) = writer.write_all(frame.encode().as_bytes()).await {
                            warn!(%error, "failed to send publish");
                            break;
                        }
                    }
                    Some(ClientOp::Disconnect) | None => {
                        let _ = writer.write_all(Frame::Disconnect.encode().as_bytes()).await;
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                for (packet_id, topic, payload) in retry_queue.due(Instant::now()) {
                    debug!(packet_id, topic = %topic, "retransmitting unacked publish");
                    let frame = Frame::Publish {
                        packet_id: Some(packet_id),
                        topic,
                        payload,
                        qos: 1,
                    };
                    if let Err(error) = writer.write_all(frame.encode().as_bytes()).await {
                        warn!(%error, "failed to retransmit publish");
                        reader_task.abort();
                        return;
                    }
                }
            }
        }
    }

    reader_task.abort();
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection to {addr} failed after {attempts} attempts: {source}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("broker rejected connection: {0}")]
    ConnectionRejected(String),
    #[error("bus handshake timed out")]
    HandshakeTimeout,
    #[error("topic length {0} exceeds limit")]
    TopicTooLong(usize),
    #[error("bus connection closed")]
    Closed,
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
