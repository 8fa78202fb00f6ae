//! Messaging capability traits
//!
//! An `Endpoint` is one agent's connection to the messaging fabric. Channels
//! are either created by the endpoint (the coordinator's game channel),
//! joined by accepting an invitation, or opened point-to-point with a peer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use twenty_core::Result;

/// Payload received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport name of the sender
    pub source: String,
    pub payload: Vec<u8>,
}

/// Channel flavour
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ChannelKind {
    /// Many-to-many group channel
    Group,
    /// Two-member side channel
    Private,
}

/// A joined channel.
///
/// All methods take `&self` so a channel can be shared (via `Arc`) between a
/// receive loop and tasks that only publish.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Channel name
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Send a payload to every other member
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Wait up to `timeout` for the next delivery; `Ok(None)` when it elapses
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Add a peer to the channel. Peers that are not connected yet receive
    /// the invitation when they connect.
    async fn invite(&self, peer: &str) -> Result<()>;
}

/// Connection to the messaging fabric
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    type Channel: Channel;

    /// Transport name of this endpoint, e.g. `guesser-Bob`
    fn local_name(&self) -> &str;

    /// Create a group channel owned by this endpoint
    async fn create_channel(&self, name: &str) -> Result<Self::Channel>;

    /// Wait up to `timeout` for an invitation; `Ok(None)` when it elapses
    async fn accept_invitation(&self, timeout: Duration) -> Result<Option<Self::Channel>>;

    /// Open a private channel with `peer`, waiting up to `wait` for the peer
    /// to be connected
    async fn open_private(&self, peer: &str, wait: Duration) -> Result<Self::Channel>;
}

/// Deterministic name for the private channel between two peers
pub fn private_channel_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("private/{}+{}", first, second)
}
