use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::config::AdmissionPolicy;
use crate::error::{ProxyError, ProxyResult};
use crate::http;
use crate::registry::{Direction, Protocol, Registry};
use crate::socks;

/// Copy-loop buffer size, one per direction.
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Shared state for the dispatcher.
pub struct RelayContext {
    pub registry: Arc<Registry>,
    pub policy: AdmissionPolicy,
}

/// Global counter feeding connection-id generation.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a connection id, unique for the process lifetime: a timestamp
/// fragment plus a monotonic counter, in compact hex.
pub fn next_connection_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn-{:x}-{:x}", now.as_nanos() & 0xffff_ffff_ffff, counter)
}

/// Accept loop: one task per admitted socket.
pub async fn serve_proxy(listener: TcpListener, ctx: Arc<RelayContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(handle_client(stream, peer_addr, ctx));
            }
            Err(e) => {
                warn!("accept error: {} (continuing)", e);
                continue;
            }
        }
    }
}

/// Full lifetime of one client connection.
pub async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<RelayContext>) {
    let client_ip = peer_addr.ip();

    if !ctx.policy.allows(client_ip) {
        debug!(%client_ip, "connection from unauthorized address blocked");
        return;
    }
    debug!(%peer_addr, "accepted new client");

    if let Err(e) = serve_connection(stream, client_ip, &ctx).await {
        debug!(%client_ip, "connection ended: {e}");
    }
}

/// What a protocol engine produced before the relay starts.
enum Handshake {
    Socks { destination: String },
    HttpConnect { destination: String },
    HttpForward { destination: String, request: Vec<u8> },
}

impl Handshake {
    fn protocol(&self) -> Protocol {
        match self {
            Handshake::Socks { .. } => Protocol::Socks5,
            _ => Protocol::Http,
        }
    }

    fn destination(&self) -> &str {
        match self {
            Handshake::Socks { destination }
            | Handshake::HttpConnect { destination }
            | Handshake::HttpForward { destination, .. } => destination,
        }
    }
}

/// Removes the record once the connection task is done with it, whatever
/// the exit path.
struct ReleaseGuard {
    registry: Arc<Registry>,
    id: String,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

async fn serve_connection(
    stream: TcpStream,
    client_ip: IpAddr,
    ctx: &RelayContext,
) -> ProxyResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Some(first_byte) = peek_first_byte(&mut reader).await? else {
        // Closed before sending anything.
        return Ok(());
    };

    let handshake = if first_byte == socks::SOCKS_VERSION {
        debug!("detected SOCKS5 connection");
        let destination = socks::handshake(&mut reader, &mut write_half).await?;
        Handshake::Socks { destination }
    } else {
        debug!("detected HTTP connection");
        let request = http::read_request(&mut reader).await?;
        if request.is_connect() {
            Handshake::HttpConnect {
                destination: request.destination,
            }
        } else {
            Handshake::HttpForward {
                destination: request.destination,
                request: request.raw,
            }
        }
    };

    let conn_id = next_connection_id();
    let destination = handshake.destination().to_string();
    ctx.registry
        .admit(&conn_id, client_ip, handshake.protocol(), &destination)
        .await;
    let _release = ReleaseGuard {
        registry: Arc::clone(&ctx.registry),
        id: conn_id.clone(),
    };

    let mut upstream = match TcpStream::connect(&destination).await {
        Ok(upstream) => upstream,
        Err(e) => {
            debug!(%destination, error = %e, "failed to connect to destination");
            let reply_result = match handshake {
                Handshake::Socks { .. } => socks::write_reply(&mut write_half, false).await,
                _ => write_half.write_all(http::BAD_GATEWAY).await,
            };
            if let Err(reply_err) = reply_result {
                debug!(error = %reply_err, "failed to send error reply");
            }
            return Err(ProxyError::UpstreamDial {
                destination,
                source: e,
            });
        }
    };

    match &handshake {
        Handshake::Socks { .. } => socks::write_reply(&mut write_half, true).await?,
        Handshake::HttpConnect { .. } => write_half.write_all(http::CONNECT_ESTABLISHED).await?,
        Handshake::HttpForward { request, .. } => upstream.write_all(request).await?,
    }

    debug!(%destination, "relaying data");

    let (upstream_read, upstream_write) = upstream.into_split();

    let outbound = tokio::spawn({
        let registry = Arc::clone(&ctx.registry);
        let id = conn_id.clone();
        async move { copy_with_accounting(reader, upstream_write, &registry, &id, Direction::Out).await }
    });
    let inbound = tokio::spawn({
        let registry = Arc::clone(&ctx.registry);
        let id = conn_id.clone();
        async move { copy_with_accounting(upstream_read, write_half, &registry, &id, Direction::In).await }
    });

    let (sent, received) = tokio::join!(outbound, inbound);
    let sent = sent.unwrap_or_else(|e| Err(std::io::Error::other(e)));
    let received = received.unwrap_or_else(|e| Err(std::io::Error::other(e)));

    match (&sent, &received) {
        (Ok(sent), Ok(received)) => {
            debug!(%destination, sent, received, "relay finished");
        }
        _ => {
            debug!(%destination, ?sent, ?received, "relay finished with error");
        }
    }
    Ok(())
}

/// Non-consuming one-byte lookahead on the buffered client stream.
async fn peek_first_byte<R>(reader: &mut R) -> std::io::Result<Option<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader.fill_buf().await?;
    Ok(available.first().copied())
}

/// One direction of the relay: read into a fixed buffer, write through,
/// account each successful write. When the source ends (EOF or error) the
/// destination's write half is shut down so the peer loop observes the
/// close within bounded time. Accounting is best-effort and never aborts
/// the copy.
async fn copy_with_accounting<R, W>(
    mut src: R,
    mut dst: W,
    registry: &Registry,
    id: &str,
    direction: Direction,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = match src.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = dst.shutdown().await;
                return Err(e);
            }
        };
        if let Err(e) = dst.write_all(&buffer[..n]).await {
            return Err(e);
        }
        written += n as u64;
        registry.account(id, direction, n as u64);
    }

    let _ = dst.shutdown().await;
    Ok(written)
}
