//! TCP relay
//!
//! Hosts a `Hub` and exposes it to remote agents. Each accepted connection
//! runs the challenge/response handshake, then maps relay frames onto a hub
//! endpoint owned by that connection:
//! - `Create` / `Invite` / `Publish` / `OpenPrivate` drive the endpoint
//! - invitations and channel deliveries are pushed back as frames
//!
//! All outbound frames for a connection go through one queue, so an `Ack`
//! always precedes the first `Deliver` of the channel it acknowledges.

use crate::auth::{fresh_nonce, verify};
use crate::channel::{Channel, Endpoint};
use crate::hub::{Hub, LocalChannel, LocalEndpoint};
use crate::protocol::{Frame, decode_payload, encode_payload};
use crate::tcp::{TcpReadWrapper, TcpWriteWrapper};
use crate::transport::{AsyncReader, AsyncWriter};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twenty_core::{GameError, Result};

const PUMP_POLL: Duration = Duration::from_millis(500);

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on (default: 127.0.0.1:46357)
    pub listen: String,
    /// Secret every client must prove knowledge of
    pub shared_secret: String,
    /// Time allowed between connect and a valid `Hello`
    pub handshake_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:46357".into(),
            shared_secret: "secret123".into(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Relay server
pub struct RelayServer {
    config: RelayConfig,
    hub: Hub,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            hub: Hub::new(),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await.map_err(|e| {
            GameError::TransportError(format!("Failed to bind {}: {}", self.config.listen, e))
        })?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| GameError::TransportError(e.to_string()))?;
        info!("Relay listening on {}", local);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, addr, hub, config).await {
                    warn!("Relay client {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Hub,
    config: RelayConfig,
) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| GameError::TransportError(format!("Failed to set TCP_NODELAY: {}", e)))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = TcpReadWrapper(read_half);
    let mut writer = TcpWriteWrapper(write_half);

    let name = handshake(&mut reader, &mut writer, &config).await?;
    info!("Relay client {} authenticated as {}", addr, name);

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let session = Session {
        endpoint: Arc::new(hub.connect(&name)),
        out: out_tx,
        channels: Arc::new(Mutex::new(HashMap::new())),
        pumps: Arc::new(Mutex::new(Vec::new())),
    };
    let invitations = tokio::spawn(session.clone().forward_invitations());

    let result = session.read_loop(&mut reader).await;

    invitations.abort();
    session.shutdown();
    writer_task.abort();
    info!("Relay client {} ({}) disconnected", name, addr);
    result
}

async fn handshake(
    reader: &mut TcpReadWrapper,
    writer: &mut TcpWriteWrapper,
    config: &RelayConfig,
) -> Result<String> {
    let nonce = fresh_nonce();
    writer
        .write_frame(&Frame::Challenge {
            nonce: nonce.clone(),
        })
        .await?;

    let hello = tokio::time::timeout(config.handshake_timeout, reader.read_frame())
        .await
        .map_err(|_| GameError::Timeout("handshake".into()))??;

    match hello {
        Frame::Hello { name, mac } if verify(&config.shared_secret, &name, &nonce, &mac) => {
            writer.write_frame(&Frame::Welcome { name: name.clone() }).await?;
            Ok(name)
        }
        Frame::Hello { name, .. } => {
            let _ = writer
                .write_frame(&Frame::Rejected {
                    reason: "invalid credentials".into(),
                })
                .await;
            Err(GameError::AuthenticationFailed(name))
        }
        other => {
            let _ = writer
                .write_frame(&Frame::Rejected {
                    reason: "expected Hello".into(),
                })
                .await;
            Err(GameError::ProtocolError(format!(
                "expected Hello, got {:?}",
                other
            )))
        }
    }
}

async fn write_loop(mut writer: TcpWriteWrapper, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            error!("Relay write failed: {}", e);
            break;
        }
    }
}

/// Per-connection state shared by the read loop and its pump tasks
#[derive(Clone)]
struct Session {
    endpoint: Arc<LocalEndpoint>,
    out: mpsc::UnboundedSender<Frame>,
    channels: Arc<Mutex<HashMap<String, Arc<LocalChannel>>>>,
    pumps: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Session {
    fn channel(&self, name: &str) -> Option<Arc<LocalChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    fn send(&self, frame: Frame) {
        // A closed queue means the connection is going away
        let _ = self.out.send(frame);
    }

    fn send_error(&self, id: Option<u64>, message: String) {
        warn!("Relay request failed for {}: {}", self.endpoint.local_name(), message);
        self.send(Frame::Error { id, message });
    }

    /// Register a joined channel, announce it, then start forwarding its
    /// deliveries
    fn attach(&self, channel: LocalChannel, ack: Option<u64>) {
        let name = channel.name().to_string();
        let kind = channel.kind();
        let channel = Arc::new(channel);
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.clone(), channel.clone());

        match ack {
            Some(id) => self.send(Frame::Ack {
                id,
                channel: name.clone(),
            }),
            None => self.send(Frame::Invited {
                channel: name.clone(),
                kind,
            }),
        }

        let out = self.out.clone();
        let pump = tokio::spawn(async move {
            while !out.is_closed() {
                match channel.receive(PUMP_POLL).await {
                    Ok(Some(delivery)) => {
                        let _ = out.send(Frame::Deliver {
                            channel: name.clone(),
                            source: delivery.source,
                            payload: encode_payload(&delivery.payload),
                        });
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Pump for {} stopped: {}", name, e);
                        break;
                    }
                }
            }
        });
        self.pumps.lock().unwrap_or_else(|p| p.into_inner()).push(pump);
    }

    async fn forward_invitations(self) {
        while !self.out.is_closed() {
            match self.endpoint.accept_invitation(PUMP_POLL).await {
                Ok(Some(channel)) => {
                    debug!(
                        "Forwarding invitation to {} for {}",
                        self.endpoint.local_name(),
                        channel.name()
                    );
                    self.attach(channel, None);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!("Invitation forwarder stopped: {}", e);
                    break;
                }
            }
        }
    }

    async fn read_loop(&self, reader: &mut TcpReadWrapper) -> Result<()> {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(GameError::MalformedEnvelope(e)) => {
                    self.send_error(None, e);
                    continue;
                }
                // Peer closed the socket
                Err(GameError::TransportError(e)) => {
                    debug!("Relay read ended: {}", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match frame {
                Frame::Create { id, channel } => {
                    match self.endpoint.create_channel(&channel).await {
                        Ok(joined) => self.attach(joined, Some(id)),
                        Err(e) => self.send_error(Some(id), e.to_string()),
                    }
                }
                Frame::Invite { channel, peer } => match self.channel(&channel) {
                    Some(joined) => {
                        if let Err(e) = joined.invite(&peer).await {
                            self.send_error(None, e.to_string());
                        }
                    }
                    None => self.send_error(None, format!("not a member of {}", channel)),
                },
                Frame::Publish { channel, payload } => {
                    let payload = match decode_payload(&payload) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            self.send_error(None, format!("bad payload encoding: {}", e));
                            continue;
                        }
                    };
                    match self.channel(&channel) {
                        Some(joined) => {
                            if let Err(e) = joined.publish(payload).await {
                                self.send_error(None, e.to_string());
                            }
                        }
                        None => self.send_error(None, format!("not a member of {}", channel)),
                    }
                }
                Frame::OpenPrivate { id, peer, wait_ms } => {
                    // Waiting for the peer must not stall this connection
                    let session = self.clone();
                    let task = tokio::spawn(async move {
                        match session
                            .endpoint
                            .open_private(&peer, Duration::from_millis(wait_ms))
                            .await
                        {
                            Ok(joined) => session.attach(joined, Some(id)),
                            Err(e) => session.send_error(Some(id), e.to_string()),
                        }
                    });
                    self.pumps.lock().unwrap_or_else(|p| p.into_inner()).push(task);
                }
                other => self.send_error(None, format!("unexpected frame: {:?}", other)),
            }
        }
    }

    fn shutdown(&self) {
        for pump in self.pumps.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            pump.abort();
        }
        self.channels.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RelayClientConfig, RelayEndpoint};

    const SHORT: Duration = Duration::from_millis(500);

    async fn start_relay(secret: &str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(RelayConfig {
            listen: addr.to_string(),
            shared_secret: secret.into(),
            handshake_timeout: Duration::from_secs(2),
        });
        tokio::spawn(server.serve(listener));
        addr
    }

    fn client_config(addr: SocketAddr, name: &str, secret: &str) -> RelayClientConfig {
        RelayClientConfig {
            address: addr.to_string(),
            name: name.into(),
            shared_secret: secret.into(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_group_channel_over_relay() {
        let addr = start_relay("s3cret").await;
        let coord = RelayEndpoint::connect(client_config(addr, "coordinator", "s3cret"))
            .await
            .unwrap();
        let bob = RelayEndpoint::connect(client_config(addr, "guesser-Bob", "s3cret"))
            .await
            .unwrap();

        let game = coord.create_channel("classroom/game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();
        let bob_game = bob.accept_invitation(SHORT).await.unwrap().unwrap();
        assert_eq!(bob_game.name(), "classroom/game");

        game.publish(b"{\"type\":\"ping\"}".to_vec()).await.unwrap();
        let got = bob_game.receive(SHORT).await.unwrap().unwrap();
        assert_eq!(got.source, "coordinator");
        assert_eq!(got.payload, b"{\"type\":\"ping\"}");

        bob_game.publish(b"pong".to_vec()).await.unwrap();
        let back = game.receive(SHORT).await.unwrap().unwrap();
        assert_eq!(back.source, "guesser-Bob");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let addr = start_relay("s3cret").await;
        let result = RelayEndpoint::connect(client_config(addr, "guesser-Eve", "guess")).await;
        assert!(matches!(result, Err(GameError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_private_channel_over_relay() {
        let addr = start_relay("s3cret").await;
        let alice = RelayEndpoint::connect(client_config(addr, "thinker-Alice", "s3cret"))
            .await
            .unwrap();

        let absent = alice
            .open_private("translator-Travis", Duration::from_millis(200))
            .await;
        assert!(absent.is_err());

        let travis = RelayEndpoint::connect(client_config(addr, "translator-Travis", "s3cret"))
            .await
            .unwrap();
        let secret = alice
            .open_private("translator-Travis", Duration::from_secs(1))
            .await
            .unwrap();
        let side = travis.accept_invitation(SHORT).await.unwrap().unwrap();

        secret.publish(b"kite".to_vec()).await.unwrap();
        let got = side.receive(SHORT).await.unwrap().unwrap();
        assert_eq!(got.payload, b"kite");
        assert_eq!(got.source, "thinker-Alice");
    }
}
