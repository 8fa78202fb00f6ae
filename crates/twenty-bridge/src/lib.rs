//! Messaging fabric for twenty-questions agents
//!
//! This crate provides:
//! - `Endpoint`/`Channel` capability traits
//! - An in-process `Hub` implementation
//! - A TCP relay that exposes a hub to remote agents, and its client
//! - Length-prefixed JSON framing (AsyncReader/AsyncWriter traits)

pub mod auth;
pub mod channel;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod relay;
pub mod tcp;
pub mod transport;

pub use channel::{Channel, ChannelKind, Delivery, Endpoint, private_channel_name};
pub use client::{RelayChannel, RelayClientConfig, RelayEndpoint};
pub use hub::{Hub, LocalChannel, LocalEndpoint};
pub use protocol::{Frame, deserialize, serialize};
pub use relay::{RelayConfig, RelayServer};
pub use transport::{AsyncReader, AsyncWriter, MAX_FRAME_LEN};
