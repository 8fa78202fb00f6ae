//! TCP transport for the relay

use crate::transport::{AsyncReader, AsyncWriter, check_frame_len};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use twenty_core::{GameError, Result};

/// TCP read wrapper
pub struct TcpReadWrapper(pub OwnedReadHalf);

#[async_trait]
impl AsyncReader for TcpReadWrapper {
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.0
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| GameError::TransportError(format!("TCP read length failed: {}", e)))?;
        let len = check_frame_len(u32::from_le_bytes(len_bytes) as usize)?;

        let mut data = vec![0u8; len];
        self.0
            .read_exact(&mut data)
            .await
            .map_err(|e| GameError::TransportError(format!("TCP read data failed: {}", e)))?;

        Ok(data)
    }
}

/// TCP write wrapper
pub struct TcpWriteWrapper(pub OwnedWriteHalf);

#[async_trait]
impl AsyncWriter for TcpWriteWrapper {
    async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        check_frame_len(data.len())?;
        let len = (data.len() as u32).to_le_bytes();
        self.0
            .write_all(&len)
            .await
            .map_err(|e| GameError::TransportError(format!("TCP write length failed: {}", e)))?;

        self.0
            .write_all(data)
            .await
            .map_err(|e| GameError::TransportError(format!("TCP write data failed: {}", e)))?;

        self.0
            .flush()
            .await
            .map_err(|e| GameError::TransportError(format!("TCP flush failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_frame_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_read, write) = stream.into_split();
            let mut writer = TcpWriteWrapper(write);
            writer
                .write_frame(&Frame::Challenge {
                    nonce: "abc123".into(),
                })
                .await
                .unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();
        let mut reader = TcpReadWrapper(read);
        match reader.read_frame().await.unwrap() {
            Frame::Challenge { nonce } => assert_eq!(nonce, "abc123"),
            other => panic!("Wrong frame: {:?}", other),
        }
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (read, _write) = stream.into_split();
        let mut reader = TcpReadWrapper(read);
        assert!(matches!(
            reader.read_message().await,
            Err(GameError::TransportError(_))
        ));
        client.await.unwrap();
    }
}
