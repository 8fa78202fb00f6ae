//! Transport abstractions for the relay
//!
//! Provides AsyncReader/AsyncWriter traits so the relay framing can run over
//! any byte stream. Frames are length-prefixed: 4-byte little-endian length
//! followed by a JSON body.

use crate::protocol::{Frame, deserialize, serialize};
use async_trait::async_trait;
use twenty_core::{GameError, Result};

/// Upper bound on a single frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Trait for async reading from a transport
#[async_trait]
pub trait AsyncReader: Send {
    /// Read a complete length-prefixed message
    async fn read_message(&mut self) -> Result<Vec<u8>>;

    /// Read and decode one relay frame
    async fn read_frame(&mut self) -> Result<Frame> {
        let data = self.read_message().await?;
        deserialize(&data).map_err(|e| GameError::MalformedEnvelope(format!("relay frame: {}", e)))
    }
}

/// Trait for async writing to a transport
#[async_trait]
pub trait AsyncWriter: Send + Sync {
    /// Write a complete length-prefixed message
    async fn write_message(&mut self, data: &[u8]) -> Result<()>;

    /// Encode and write one relay frame
    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let data = serialize(frame)?;
        self.write_message(&data).await
    }
}

/// Validate a length prefix read off the wire
pub(crate) fn check_frame_len(len: usize) -> Result<usize> {
    if len > MAX_FRAME_LEN {
        return Err(GameError::TransportError(format!(
            "Frame too large: {} bytes",
            len
        )));
    }
    Ok(len)
}
