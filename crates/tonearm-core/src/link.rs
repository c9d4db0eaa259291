use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed by peer")]
    Closed,
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("no server reachable after {attempts} attempts")]
    Unreachable { attempts: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Any bidirectional byte stream the protocol can run over.
pub trait ByteLink: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteLink for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type LinkHandle = Box<dyn ByteLink>;

/// Two connected in-memory endpoints, used in place of a socket in tests.
pub fn memory_link_pair(capacity: usize) -> (LinkHandle, LinkHandle) {
    let (a, b) = tokio::io::duplex(capacity);
    (Box::new(a), Box::new(b))
}

/// Open a TCP connection to `addr` (host:port), bounded by `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<LinkHandle, LinkError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| LinkError::ConnectTimeout {
            addr: addr.to_string(),
            timeout,
        })??;
    stream.set_nodelay(true)?;
    debug!(target: "tonearm::connection", %addr, "connected");
    Ok(Box::new(stream))
}

/// Try each address in order and return the first that accepts.
pub async fn connect_any<S: AsRef<str>>(
    addrs: &[S],
    timeout: Duration,
) -> Result<(LinkHandle, String), LinkError> {
    for addr in addrs {
        let addr = addr.as_ref();
        match connect(addr, timeout).await {
            Ok(link) => return Ok((link, addr.to_string())),
            Err(err) => {
                warn!(target: "tonearm::connection", %addr, error = %err, "connect attempt failed");
            }
        }
    }
    Err(LinkError::Unreachable {
        attempts: addrs.len(),
    })
}

/// `read_exact` that reports a clean end of stream as [`LinkError::Closed`].
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), LinkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(LinkError::Closed),
        Err(err) => Err(LinkError::Io(err)),
    }
}

/// Write all of `buf` and flush.
pub async fn write_all<W>(writer: &mut W, buf: &[u8]) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(buf).await.map_err(map_write_error)?;
    writer.flush().await.map_err(map_write_error)?;
    Ok(())
}

fn map_write_error(err: io::Error) -> LinkError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => LinkError::Closed,
        _ => LinkError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn memory_link_carries_bytes_both_ways() {
        let (mut client, mut server) = memory_link_pair(64);

        write_all(&mut client, b"hello").await.expect("client write");
        let mut buf = [0u8; 5];
        read_exact(&mut server, &mut buf).await.expect("server read");
        assert_eq!(&buf, b"hello");

        write_all(&mut server, b"back").await.expect("server write");
        let mut buf = [0u8; 4];
        read_exact(&mut client, &mut buf).await.expect("client read");
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_closed() {
        let (mut client, server) = memory_link_pair(64);
        drop(server);
        let mut buf = [0u8; 3];
        let err = read_exact(&mut client, &mut buf).await.unwrap_err();
        assert!(matches!(err, LinkError::Closed));
    }

    #[tokio::test]
    async fn connect_any_skips_dead_addresses() {
        let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind dead");
        let dead_addr = dead.local_addr().expect("dead addr").to_string();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.expect("bind live");
        let live_addr = live.local_addr().expect("live addr").to_string();
        let accept = tokio::spawn(async move { live.accept().await.map(|_| ()) });

        let (_link, chosen) = connect_any(&[dead_addr, live_addr.clone()], Duration::from_secs(1))
            .await
            .expect("second address connects");
        assert_eq!(chosen, live_addr);
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn connect_any_reports_exhaustion() {
        let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let dead_addr = dead.local_addr().expect("addr").to_string();
        drop(dead);

        let err = connect_any(&[dead_addr], Duration::from_millis(500))
            .await
            .err()
            .expect("no server reachable");
        assert!(matches!(err, LinkError::Unreachable { attempts: 1 }));
    }
}
