//! Duplex byte stream owned by a connection, upgradable to TLS once.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::error::Result;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Wraps a plaintext stream into an encrypted one after `<proceed/>`.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    async fn upgrade(&self, stream: BoxedStream, server_name: &str) -> Result<BoxedStream>;
}

pub struct Transport {
    stream: BoxedStream,
    secure: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("secure", &self.secure).finish()
    }
}

impl Transport {
    pub fn plain(stream: impl AsyncStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            secure: false,
        }
    }

    /// A stream that is already encrypted (direct TLS endpoints).
    pub fn secure(stream: BoxedStream) -> Self {
        Self {
            stream,
            secure: true,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn reader(&mut self) -> &mut BoxedStream {
        &mut self.stream
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Replace the plaintext stream with its TLS-wrapped successor.
    ///
    /// Bytes the codec buffered from the old stream are not carried over; the
    /// caller discards them before calling this.
    ///
    /// # Panics
    ///
    /// Panics when the transport is already secure: a stream is upgraded at
    /// most once in its lifetime.
    pub async fn upgrade(self, upgrader: &dyn TlsUpgrader, server_name: &str) -> Result<Transport> {
        if self.secure {
            panic!("transport already upgraded to TLS");
        }
        debug!(server_name, "Upgrading transport to TLS");
        let stream = upgrader.upgrade(self.stream, server_name).await?;
        Ok(Transport {
            stream,
            secure: true,
        })
    }

    pub fn into_split(self) -> (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) {
        tokio::io::split(self.stream)
    }
}
