use crate::bus::Frame;
use crate::protocol::topic_matches;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

// Per-client outbound buffer. A consumer that falls this far behind is
// disconnected instead of stalling everyone else.
const CLIENT_OUTBOUND_BUFFER: usize = 256;

#[derive(Debug)]
struct ClientEntry {
    client_id: String,
    patterns: Vec<String>,
    outbound: mpsc::Sender<String>,
}

type Registry = Arc<Mutex<HashMap<u64, ClientEntry>>>;

/// Minimal pub/sub broker for the printer fleet: wildcard subscriptions,
/// QoS-1 acks, fan-out to every matching subscriber.
#[derive(Debug)]
pub struct Broker {
    credentials: Option<(String, String)>,
    registry: Registry,
    next_session: AtomicU64,
}

impl Broker {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self {
            credentials,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_session: AtomicU64::new(1),
        }
    }

    /// Accept loop. Runs until the listener fails; each client gets its own
    /// task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "broker listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let broker = Arc::clone(&self);
            tokio::spawn(async move {
                let session = broker.next_session.fetch_add(1, Ordering::Relaxed);
                debug!(%addr, session, "client connected");
                if let Err(error) = broker.handle_client(stream, session).await {
                    debug!(%addr, session, %error, "client session ended");
                }
                broker.registry.lock().await.remove(&session);
                debug!(%addr, session, "client disconnected");
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, session: u64) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Writer drains a bounded queue so one slow client cannot block the
        // publish path.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(CLIENT_OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut line = String::new();
        let mut connected = false;
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let frame = match serde_json::from_str::<Frame>(trimmed) {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(session, %error, "dropping malformed frame");
                    continue;
                }
            };

            match frame {
                Frame::Connect {
                    client_id,
                    username,
                    password,
                } => {
                    let ack = if self.credentials_accepted(username.as_deref(), password.as_deref())
                    {
                        connected = true;
                        let mut registry = self.registry.lock().await;
                        registry.insert(
                            session,
                            ClientEntry {
                                client_id: client_id.clone(),
                                patterns: Vec::new(),
                                outbound: outbound_tx.clone(),
                            },
                        );
                        info!(session, client_id = %client_id, "client authenticated");
                        Frame::ConnAck {
                            ok: true,
                            error: None,
                        }
                    } else {
                        warn!(session, client_id = %client_id, "rejected credentials");
                        Frame::ConnAck {
                            ok: false,
                            error: Some("bad credentials".to_string()),
                        }
                    };
                    let rejected = matches!(ack, Frame::ConnAck { ok: false, .. });
                    if outbound_tx.send(ack.encode()).await.is_err() || rejected {
                        break;
                    }
                }
                Frame::Subscribe { pattern } => {
                    if !connected {
                        continue;
                    }
                    let mut registry = self.registry.lock().await;
                    if let Some(entry) = registry.get_mut(&session) {
                        debug!(session, pattern = %pattern, "subscription added");
                        entry.patterns.push(pattern);
                    }
                }
                Frame::Publish {
                    packet_id,
                    topic,
                    payload,
                    qos,
                } => {
                    if !connected {
                        continue;
                    }
                    // QoS 1: ack to the publisher before fan-out; redelivery
                    // on a missing ack is the publisher's job.
                    if qos >= 1 {
                        if let Some(packet_id) = packet_id {
                            let ack = Frame::PubAck { packet_id };
                            if outbound_tx.send(ack.encode()).await.is_err() {
                                break;
                            }
                        }
                    }
                    self.fan_out(&topic, &payload).await;
                }
                Frame::Disconnect => break,
                other => {
                    debug!(session, frame = ?other, "ignoring unexpected frame");
                }
            }
        }

        drop(outbound_tx);
        let _ = writer_task.await;
        Ok(())
    }

    fn credentials_accepted(&self, username: Option<&str>, password: Option<&str>) -> bool {
        match &self.credentials {
            None => true,
            Some((expected_user, expected_pass)) => {
                username == Some(expected_user.as_str())
                    && password == Some(expected_pass.as_str())
            }
        }
    }

    /// Deliver a message to every client with a matching subscription.
    /// Clients whose outbound queue is full are dropped from the registry.
    async fn fan_out(&self, topic: &str, payload: &str) {
        let message = Frame::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
        .encode();

        let mut stalled = Vec::new();
        let mut registry = self.registry.lock().await;
        for (&session, entry) in registry.iter() {
            if !entry
                .patterns
                .iter()
                .any(|pattern| topic_matches(pattern, topic))
            {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.outbound.try_send(message.clone())
            {
                warn!(
                    session,
                    client_id = %entry.client_id,
                    "disconnecting stalled subscriber"
                );
                stalled.push(session);
            }
        }
        for session in stalled {
            registry.remove(&session);
        }
    }
}
