//! Symmetric byte relay between a stolen client stream and a target.
//!
//! # Responsibilities
//! - Copy bytes in both directions through fixed-size buffers
//! - Tear both ends down when either side closes or fails
//! - Count relayed bytes per direction
//!
//! # Design Decisions
//! - A direction reads again only after the previous chunk was written and
//!   flushed in full, so a slow reader back-pressures its peer
//! - One cancellation token stops both directions; cancellation is not an
//!   error and is not logged as one

use std::io;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Per-direction buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Why a tunnel stopped.
#[derive(Debug)]
pub enum TunnelClose {
    /// The client sent EOF.
    ClientClosed,
    /// The target sent EOF.
    TargetClosed,
    /// The cancellation token fired.
    Cancelled,
    /// Reading or writing either end failed.
    Error(io::Error),
}

/// Outcome of [`Tunnel::run`].
#[derive(Debug)]
pub struct TunnelReport {
    pub close: TunnelClose,
    /// Bytes fully written to the target.
    pub client_to_target: u64,
    /// Bytes fully written to the client.
    pub target_to_client: u64,
}

/// One side of a tunnel.
struct TunnelEnd<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buffer: Vec<u8>,
    bytes_written: u64,
}

impl<S: AsyncRead + AsyncWrite> TunnelEnd<S> {
    fn new(stream: S, buffer_size: usize) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader,
            writer,
            buffer: vec![0; buffer_size],
            bytes_written: 0,
        }
    }
}

/// Read from one end into its buffer and write everything to the other.
async fn pump<R, W>(
    reader: &mut R,
    buffer: &mut [u8],
    writer: &mut W,
    bytes_written: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buffer).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
        *bytes_written += n as u64;
    }
}

/// Bidirectional relay between a client and a target stream.
pub struct Tunnel<C, T> {
    client: TunnelEnd<C>,
    target: TunnelEnd<T>,
    cancel: CancellationToken,
}

impl<C, T> Tunnel<C, T>
where
    C: AsyncRead + AsyncWrite + Send,
    T: AsyncRead + AsyncWrite + Send,
{
    /// Tunnel with [`DEFAULT_BUFFER_SIZE`] buffers.
    pub fn new(client: C, target: T, cancel: CancellationToken) -> Self {
        Self::with_buffer_size(client, target, cancel, DEFAULT_BUFFER_SIZE)
    }

    /// Tunnel with `buffer_size` bytes of buffer per direction.
    pub fn with_buffer_size(client: C, target: T, cancel: CancellationToken, buffer_size: usize) -> Self {
        Self {
            client: TunnelEnd::new(client, buffer_size.max(1)),
            target: TunnelEnd::new(target, buffer_size.max(1)),
            cancel,
        }
    }

    /// Relay until either end closes, an error occurs or the token fires.
    /// Both ends are shut down before returning.
    pub async fn run(mut self) -> TunnelReport {
        let close = {
            let client = &mut self.client;
            let target = &mut self.target;
            let upstream = pump(
                &mut client.reader,
                &mut client.buffer,
                &mut target.writer,
                &mut target.bytes_written,
            );
            let downstream = pump(
                &mut target.reader,
                &mut target.buffer,
                &mut client.writer,
                &mut client.bytes_written,
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => TunnelClose::Cancelled,
                result = upstream => result.map_or_else(TunnelClose::Error, |()| TunnelClose::ClientClosed),
                result = downstream => result.map_or_else(TunnelClose::Error, |()| TunnelClose::TargetClosed),
            }
        };

        // Anything still in flight on the other direction is abandoned.
        self.cancel.cancel();
        let _ = self.client.writer.shutdown().await;
        let _ = self.target.writer.shutdown().await;

        match &close {
            TunnelClose::Error(e) => tracing::warn!(error = %e, "Tunnel failed"),
            TunnelClose::Cancelled => {}
            reason => tracing::debug!(?reason, "Tunnel closed"),
        }

        TunnelReport {
            close,
            client_to_target: self.target.bytes_written,
            target_to_client: self.client.bytes_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relays_both_directions_byte_for_byte() {
        let (client, mut client_peer) = duplex(4096);
        let (target, mut target_peer) = duplex(4096);
        let tunnel = tokio::spawn(Tunnel::with_buffer_size(client, target, CancellationToken::new(), 7).run());

        let upstream: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        client_peer.write_all(&upstream).await.unwrap();
        let mut received = vec![0; upstream.len()];
        target_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, upstream);

        target_peer.write_all(b"pong").await.unwrap();
        let mut reply = [0; 4];
        client_peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(client_peer);
        let report = tokio::time::timeout(Duration::from_secs(1), tunnel).await.unwrap().unwrap();
        assert!(matches!(report.close, TunnelClose::ClientClosed));
        assert_eq!(report.client_to_target, 1000);
        assert_eq!(report.target_to_client, 4);
    }

    #[tokio::test]
    async fn target_eof_closes_client() {
        let (client, mut client_peer) = duplex(64);
        let (target, target_peer) = duplex(64);
        let tunnel = tokio::spawn(Tunnel::new(client, target, CancellationToken::new()).run());

        drop(target_peer);
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let report = tunnel.await.unwrap();
        assert!(matches!(report.close, TunnelClose::TargetClosed));
    }

    #[tokio::test]
    async fn cancellation_stops_idle_tunnel() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);
        let cancel = CancellationToken::new();
        let tunnel = tokio::spawn(Tunnel::new(client, target, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), tunnel).await.unwrap().unwrap();
        assert!(matches!(report.close, TunnelClose::Cancelled));
        assert_eq!(report.client_to_target + report.target_to_client, 0);
    }
}
