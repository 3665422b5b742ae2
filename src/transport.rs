use std::io::IoSlice;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use rand::Rng;
use tokio::net::TcpStream;
use tracing::{trace, warn};

use crate::config::MessengerConfig;

/// A pipe's socket, shared between its reader and writer. All methods take
///  `&self`: readiness waiting plus non-blocking reads/writes, so a fault can
///  half-shut the socket out from under a task parked in either direction.
#[derive(Clone)]
pub(crate) struct SocketIo {
    stream: Arc<TcpStream>,
    config: Arc<MessengerConfig>,
}

impl SocketIo {
    pub fn new(stream: TcpStream, config: Arc<MessengerConfig>) -> SocketIo {
        if config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("couldn't set TCP_NODELAY: {}", e);
            }
        }
        SocketIo {
            stream: Arc::new(stream),
            config,
        }
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Half-shut both directions; any task blocked on readiness wakes with an
    ///  error. Idempotent, and deliberately infallible: shutting down an
    ///  already-dead socket is fine.
    pub fn shutdown(&self) {
        let _ = nix::sys::socket::shutdown(
            self.stream.as_raw_fd(),
            nix::sys::socket::Shutdown::Both,
        );
    }

    fn maybe_inject_failure(&self) {
        let n = self.config.inject_socket_failures;
        if n > 0 && rand::thread_rng().gen_range(0..n) == 0 {
            warn!("injecting socket failure");
            self.shutdown();
        }
    }

    /// Wait for readability, honoring the configured read timeout (zero means
    ///  wait forever). A timeout is an error: the caller treats it as a
    ///  transport fault.
    async fn read_wait(&self) -> anyhow::Result<()> {
        let timeout = self.config.tcp_read_timeout;
        if timeout.is_zero() {
            self.stream.readable().await?;
        } else {
            tokio::time::timeout(timeout, self.stream.readable())
                .await
                .map_err(|_| anyhow!("read timed out after {:?}", timeout))??;
        }
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. Zero bytes after positive readiness is
    ///  a peer FIN and reported as an error.
    pub async fn read_exact(&self, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            self.maybe_inject_failure();
            self.read_wait().await?;
            match self.stream.try_read(&mut buf[filled..]) {
                Ok(0) => bail!("peer closed the connection"),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("socket read"),
            }
        }
        Ok(())
    }

    pub async fn read_u64_le(&self) -> anyhow::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }

    pub async fn write_u64_le(&self, value: u64) -> anyhow::Result<()> {
        self.write_all_segments(&[&value.to_le_bytes()]).await
    }

    /// Scatter-gather write of all segments, advancing across short writes.
    pub async fn write_all_segments(&self, segments: &[&[u8]]) -> anyhow::Result<()> {
        let mut idx = 0;
        let mut off = 0;
        while idx < segments.len() && segments[idx].is_empty() {
            idx += 1;
        }

        while idx < segments.len() {
            self.maybe_inject_failure();
            self.stream.writable().await?;

            let mut slices = Vec::with_capacity(segments.len() - idx);
            slices.push(IoSlice::new(&segments[idx][off..]));
            for segment in &segments[idx + 1..] {
                if !segment.is_empty() {
                    slices.push(IoSlice::new(segment));
                }
            }

            match self.stream.try_write_vectored(&slices) {
                Ok(0) => bail!("socket write made no progress"),
                Ok(written) => {
                    trace!("wrote {} bytes", written);
                    let mut left = written;
                    while left > 0 {
                        let in_segment = segments[idx].len() - off;
                        if left >= in_segment {
                            left -= in_segment;
                            off = 0;
                            idx += 1;
                            while idx < segments.len() && segments[idx].is_empty() {
                                idx += 1;
                            }
                        } else {
                            off += left;
                            left = 0;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e).context("socket write"),
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (SocketIo, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        let config = Arc::new(MessengerConfig::new());
        (SocketIo::new(accepted.unwrap().0, config), connected.unwrap())
    }

    #[tokio::test]
    async fn test_read_exact_across_partial_writes() {
        let (io, mut raw) = pair().await;

        let writer = tokio::spawn(async move {
            raw.write_all(b"hello").await.unwrap();
            raw.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            raw.write_all(b" world").await.unwrap();
            raw
        });

        let mut buf = [0u8; 11];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_detects_fin() {
        let (io, raw) = pair().await;
        drop(raw);

        let mut buf = [0u8; 4];
        let err = io.read_exact(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("closed"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_write_segments_roundtrip() {
        let (io, mut raw) = pair().await;

        let big = vec![0xabu8; 100_000];
        let segments: Vec<&[u8]> = vec![b"tag", b"", b"header", &big, b"footer"];
        let total: usize = segments.iter().map(|s| s.len()).sum();

        let reader = tokio::spawn(async move {
            let mut received = vec![0u8; total];
            raw.read_exact(&mut received).await.unwrap();
            received
        });

        io.write_all_segments(&segments).await.unwrap();

        let received = reader.await.unwrap();
        assert_eq!(&received[..3], b"tag");
        assert_eq!(&received[3..9], b"header");
        assert_eq!(&received[9..9 + big.len()], &big[..]);
        assert_eq!(&received[9 + big.len()..], b"footer");
    }

    #[tokio::test]
    async fn test_write_all_empty_segments_is_noop() {
        let (io, _raw) = pair().await;
        io.write_all_segments(&[b"", b""]).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accepted, _connected) = tokio::join!(listener.accept(), connect);

        let mut config = MessengerConfig::new();
        config.tcp_read_timeout = std::time::Duration::from_millis(50);
        let io = SocketIo::new(accepted.unwrap().0, Arc::new(config));

        let mut buf = [0u8; 1];
        let err = io.read_exact(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_reader() {
        let (io, _raw) = pair().await;
        let io2 = io.clone();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            io2.read_exact(&mut buf).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        io.shutdown();
        assert!(reader.await.unwrap().is_err());
    }
}
