//! Relay client
//!
//! `RelayEndpoint` implements the messaging capability over a TCP connection
//! to a `RelayServer`. A background reader task demultiplexes incoming
//! frames into per-channel inboxes, the invitation queue, and the waiters of
//! outstanding requests.

use crate::auth::sign;
use crate::channel::{Channel, ChannelKind, Delivery, Endpoint};
use crate::protocol::{Frame, decode_payload, encode_payload};
use crate::tcp::{TcpReadWrapper, TcpWriteWrapper};
use crate::transport::{AsyncReader, AsyncWriter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twenty_core::{GameError, Result};

/// Extra time allowed for the relay to answer a request
const REQUEST_GRACE: Duration = Duration::from_secs(5);

/// Client connection settings
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Relay address, e.g. `127.0.0.1:46357`
    pub address: String,
    /// Transport name to register under, e.g. `guesser-Bob`
    pub name: String,
    pub shared_secret: String,
    pub connect_timeout: Duration,
}

type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// A channel the relay has confirmed membership of
struct Joined {
    channel: String,
    inbox: Inbox,
}

struct Shared {
    writer: tokio::sync::Mutex<TcpWriteWrapper>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Joined>>>>,
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

impl Shared {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.writer.lock().await.write_frame(&frame).await
    }

    fn open_inbox(&self, channel: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(channel.to_string(), tx);
        rx
    }

    fn complete(&self, id: u64, result: Result<Joined>) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!("Relay answered unknown request {}", id),
        }
    }

    /// Issue a request and wait for its `Ack` or `Error`
    async fn request(&self, frame: impl FnOnce(u64) -> Frame, wait: Duration) -> Result<Joined> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, tx);

        if let Err(e) = self.send(frame(id)).await {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GameError::TransportError("relay connection closed".into())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                Err(GameError::Timeout(format!("relay request {}", id)))
            }
        }
    }
}

/// Connection to a relay
pub struct RelayEndpoint {
    name: String,
    shared: Arc<Shared>,
    invitations: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, ChannelKind, Inbox)>>,
    reader: JoinHandle<()>,
}

impl RelayEndpoint {
    /// Connect and authenticate
    pub async fn connect(config: RelayClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| GameError::Timeout(format!("connecting to relay {}", config.address)))?
            .map_err(|e| {
                GameError::TransportError(format!("TCP connect to {} failed: {}", config.address, e))
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| GameError::TransportError(format!("Failed to set TCP_NODELAY: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = TcpReadWrapper(read_half);
        let mut writer = TcpWriteWrapper(write_half);

        let handshake = async {
            let nonce = match reader.read_frame().await? {
                Frame::Challenge { nonce } => nonce,
                other => {
                    return Err(GameError::ProtocolError(format!(
                        "expected Challenge, got {:?}",
                        other
                    )));
                }
            };
            writer
                .write_frame(&Frame::Hello {
                    name: config.name.clone(),
                    mac: sign(&config.shared_secret, &config.name, &nonce),
                })
                .await?;
            match reader.read_frame().await {
                Ok(Frame::Welcome { .. }) => Ok(()),
                Ok(Frame::Rejected { reason }) => Err(GameError::AuthenticationFailed(reason)),
                Ok(other) => Err(GameError::ProtocolError(format!(
                    "expected Welcome, got {:?}",
                    other
                ))),
                // The relay may close before we read the rejection
                Err(GameError::TransportError(e)) => Err(GameError::AuthenticationFailed(e)),
                Err(e) => Err(e),
            }
        };
        tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| GameError::Timeout("relay handshake".into()))??;

        info!("Connected to relay {} as {}", config.address, config.name);

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
        });
        let (invite_tx, invite_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_task(reader, shared.clone(), invite_tx));

        Ok(Self {
            name: config.name,
            shared,
            invitations: tokio::sync::Mutex::new(invite_rx),
            reader,
        })
    }

    fn channel(&self, joined: Joined, kind: ChannelKind) -> RelayChannel {
        RelayChannel {
            name: joined.channel,
            kind,
            shared: self.shared.clone(),
            inbox: tokio::sync::Mutex::new(joined.inbox),
        }
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background task routing relay frames
async fn reader_task(
    mut reader: TcpReadWrapper,
    shared: Arc<Shared>,
    invitations: mpsc::UnboundedSender<(String, ChannelKind, Inbox)>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Frame::Deliver {
                channel,
                source,
                payload,
            }) => {
                let payload = match decode_payload(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping delivery on {} with bad encoding: {}", channel, e);
                        continue;
                    }
                };
                let inbox = shared
                    .inboxes
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .get(&channel)
                    .cloned();
                match inbox {
                    Some(tx) => {
                        let _ = tx.send(Delivery { source, payload });
                    }
                    None => warn!("Delivery for unknown channel {}", channel),
                }
            }
            Ok(Frame::Invited { channel, kind }) => {
                debug!("Invited to {}", channel);
                let inbox = shared.open_inbox(&channel);
                let _ = invitations.send((channel, kind, inbox));
            }
            Ok(Frame::Ack { id, channel }) => {
                let inbox = shared.open_inbox(&channel);
                shared.complete(id, Ok(Joined { channel, inbox }));
            }
            Ok(Frame::Error {
                id: Some(id),
                message,
            }) => {
                shared.complete(id, Err(GameError::TransportError(message)));
            }
            Ok(Frame::Error { id: None, message }) => {
                warn!("Relay reported: {}", message);
            }
            Ok(other) => {
                warn!("Unexpected frame from relay: {:?}", other);
            }
            Err(GameError::MalformedEnvelope(e)) => {
                error!("Failed to decode relay frame: {}", e);
            }
            Err(e) => {
                error!("Relay connection lost: {}", e);
                // Dropping the senders fails every waiter and closes every inbox
                shared.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
                shared.inboxes.lock().unwrap_or_else(|p| p.into_inner()).clear();
                break;
            }
        }
    }
}

#[async_trait]
impl Endpoint for RelayEndpoint {
    type Channel = RelayChannel;

    fn local_name(&self) -> &str {
        &self.name
    }

    async fn create_channel(&self, name: &str) -> Result<RelayChannel> {
        let channel = name.to_string();
        let joined = self
            .shared
            .request(|id| Frame::Create { id, channel }, REQUEST_GRACE)
            .await?;
        Ok(self.channel(joined, ChannelKind::Group))
    }

    async fn accept_invitation(&self, timeout: Duration) -> Result<Option<RelayChannel>> {
        let mut rx = self.invitations.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some((channel, kind, inbox))) => Ok(Some(self.channel(Joined { channel, inbox }, kind))),
            Ok(None) => Err(GameError::TransportError("relay connection closed".into())),
            Err(_) => Ok(None),
        }
    }

    async fn open_private(&self, peer: &str, wait: Duration) -> Result<RelayChannel> {
        let peer = peer.to_string();
        let wait_ms = wait.as_millis() as u64;
        let joined = self
            .shared
            .request(
                |id| Frame::OpenPrivate { id, peer, wait_ms },
                wait + REQUEST_GRACE,
            )
            .await?;
        Ok(self.channel(joined, ChannelKind::Private))
    }
}

/// Channel membership held through a relay
pub struct RelayChannel {
    name: String,
    kind: ChannelKind,
    shared: Arc<Shared>,
    inbox: tokio::sync::Mutex<Inbox>,
}

#[async_trait]
impl Channel for RelayChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.shared
            .send(Frame::Publish {
                channel: self.name.clone(),
                payload: encode_payload(&payload),
            })
            .await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let mut rx = self.inbox.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => Err(GameError::TransportError(format!(
                "relay closed channel {}",
                self.name
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn invite(&self, peer: &str) -> Result<()> {
        self.shared
            .send(Frame::Invite {
                channel: self.name.clone(),
                peer: peer.to_string(),
            })
            .await
    }
}
