//! In-process message hub
//!
//! Implements the messaging capability with tokio channels. Used directly by
//! tests and the single-process `play` mode, and as the routing core of the
//! TCP relay.

use crate::channel::{Channel, ChannelKind, Delivery, Endpoint, private_channel_name};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use twenty_core::{GameError, Result};

const PEER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pending channel membership handed to an invited peer
pub(crate) struct Invitation {
    channel: String,
    kind: ChannelKind,
    inbox: mpsc::UnboundedReceiver<Delivery>,
}

struct ChannelState {
    kind: ChannelKind,
    members: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, mpsc::UnboundedSender<Invitation>>,
    /// Invitations for peers that have not connected yet
    pending_invites: HashMap<String, Vec<Invitation>>,
    channels: HashMap<String, ChannelState>,
}

/// Shared routing table; cheap to clone
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubState>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect a named peer. A second connection under the same name
    /// replaces the first.
    pub fn connect(&self, name: &str) -> LocalEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();

        if state.peers.insert(name.to_string(), tx.clone()).is_some() {
            warn!("Peer {} reconnected, replacing previous endpoint", name);
        }
        for invitation in state.pending_invites.remove(name).unwrap_or_default() {
            debug!("Delivering deferred invitation to {}: {}", name, invitation.channel);
            let _ = tx.send(invitation);
        }
        drop(state);

        LocalEndpoint {
            name: name.to_string(),
            hub: self.clone(),
            registration: tx,
            invitations: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.state().peers.contains_key(name)
    }

    /// Names of channels `peer` belongs to
    pub fn memberships(&self, peer: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .channels
            .iter()
            .filter(|(_, ch)| ch.members.contains_key(peer))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn disconnect(&self, name: &str, registration: &mpsc::UnboundedSender<Invitation>) {
        let mut state = self.state();
        let ours = state
            .peers
            .get(name)
            .is_some_and(|current| current.same_channel(registration));
        if ours {
            state.peers.remove(name);
            debug!("Peer {} disconnected", name);
        }
    }

    /// Add `member` to a channel, creating it if needed
    fn join(&self, channel: &str, kind: ChannelKind, member: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let entry = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelState {
                kind,
                members: HashMap::new(),
            });
        entry.members.insert(member.to_string(), tx);
        rx
    }

    fn invite(&self, channel: &str, peer: &str) -> Result<()> {
        let mut state = self.state();
        let ch = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| GameError::NotFound(format!("channel {}", channel)))?;

        if ch.members.contains_key(peer) {
            debug!("{} is already a member of {}", peer, channel);
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        ch.members.insert(peer.to_string(), tx);
        let invitation = Invitation {
            channel: channel.to_string(),
            kind: ch.kind,
            inbox: rx,
        };

        let undelivered = match state.peers.get(peer) {
            Some(peer_tx) => peer_tx.send(invitation).err().map(|e| e.0),
            None => Some(invitation),
        };
        if let Some(invitation) = undelivered {
            debug!("{} not connected, deferring invitation to {}", peer, channel);
            state
                .pending_invites
                .entry(peer.to_string())
                .or_default()
                .push(invitation);
        }
        Ok(())
    }

    fn publish(&self, channel: &str, source: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        let ch = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| GameError::NotFound(format!("channel {}", channel)))?;

        // Members whose receiver is gone are pruned
        ch.members.retain(|member, tx| {
            if member == source {
                return true;
            }
            tx.send(Delivery {
                source: source.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
        Ok(())
    }
}

/// Hub connection for one peer
pub struct LocalEndpoint {
    name: String,
    hub: Hub,
    registration: mpsc::UnboundedSender<Invitation>,
    invitations: tokio::sync::Mutex<mpsc::UnboundedReceiver<Invitation>>,
}

impl LocalEndpoint {
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.hub.disconnect(&self.name, &self.registration);
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    type Channel = LocalChannel;

    fn local_name(&self) -> &str {
        &self.name
    }

    async fn create_channel(&self, name: &str) -> Result<LocalChannel> {
        let inbox = self.hub.join(name, ChannelKind::Group, &self.name);
        Ok(LocalChannel::new(name, ChannelKind::Group, &self.name, self.hub.clone(), inbox))
    }

    async fn accept_invitation(&self, timeout: Duration) -> Result<Option<LocalChannel>> {
        let mut rx = self.invitations.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(inv)) => Ok(Some(LocalChannel::new(
                &inv.channel,
                inv.kind,
                &self.name,
                self.hub.clone(),
                inv.inbox,
            ))),
            Ok(None) => Err(GameError::TransportError(format!(
                "{} was disconnected from the hub",
                self.name
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn open_private(&self, peer: &str, wait: Duration) -> Result<LocalChannel> {
        let deadline = Instant::now() + wait;
        while !self.hub.is_connected(peer) {
            if Instant::now() >= deadline {
                return Err(GameError::Timeout(format!(
                    "{} did not connect within {:?}",
                    peer, wait
                )));
            }
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }

        let name = private_channel_name(&self.name, peer);
        let inbox = self.hub.join(&name, ChannelKind::Private, &self.name);
        self.hub.invite(&name, peer)?;
        Ok(LocalChannel::new(&name, ChannelKind::Private, &self.name, self.hub.clone(), inbox))
    }
}

/// Hub channel membership
pub struct LocalChannel {
    name: String,
    kind: ChannelKind,
    member: String,
    hub: Hub,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl LocalChannel {
    fn new(
        name: &str,
        kind: ChannelKind,
        member: &str,
        hub: Hub,
        inbox: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            member: member.to_string(),
            hub,
            inbox: tokio::sync::Mutex::new(inbox),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.hub.publish(&self.name, &self.member, payload)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let mut rx = self.inbox.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => Err(GameError::TransportError(format!(
                "membership of {} in {} was revoked",
                self.member, self.name
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn invite(&self, peer: &str) -> Result<()> {
        self.hub.invite(&self.name, peer)
    }
}
