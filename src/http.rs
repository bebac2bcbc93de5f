use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{ProxyError, ProxyResult};

/// Upper bound on the request line + header section.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Verbatim reply for an established CONNECT tunnel.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Minimal error reply when the upstream dial fails.
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Gateway";

/// One parsed HTTP/1.x request head.
///
/// `raw` holds the request line and headers exactly as received (including
/// the terminating blank line); forwarding writes these bytes untouched, so
/// header casing and whitespace reach the upstream as the client sent them.
/// Body bytes are never parsed here: anything past the head stays in the
/// buffered reader and flows through the relay.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub destination: String,
    pub raw: Vec<u8>,
}

impl ParsedRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Read and parse a single request head from the client.
pub async fn read_request<R>(reader: &mut R) -> ProxyResult<ParsedRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();

    let request_line = read_line(reader, &mut raw).await?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::Framing(format!(
            "malformed request line '{request_line}'"
        )));
    };
    let method = method.to_string();
    let target = target.to_string();

    let mut host_header = None;
    loop {
        let line = read_line(reader, &mut raw).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host_header = Some(value.trim().to_string());
            }
        }
    }

    let authority = if method.eq_ignore_ascii_case("CONNECT") {
        target
    } else if let Some(rest) = target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(ProxyError::Framing("request target has no host".to_string()));
        }
        authority.to_string()
    } else {
        host_header.ok_or_else(|| ProxyError::Framing("missing Host header".to_string()))?
    };
    if authority.is_empty() {
        return Err(ProxyError::Framing("request target has no host".to_string()));
    }

    Ok(ParsedRequest {
        method,
        destination: ensure_port(&authority, 80),
        raw,
    })
}

/// Read one CRLF-terminated line, appending the raw bytes (delimiter
/// included) to `raw`. Bounded by [`MAX_HEADER_BYTES`] across the whole
/// head.
async fn read_line<R>(reader: &mut R, raw: &mut Vec<u8>) -> ProxyResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = (MAX_HEADER_BYTES - raw.len()) as u64;
    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(remaining);
    let n = limited.read_until(b'\n', &mut line).await?;

    if n == 0 {
        return Err(ProxyError::Framing(
            "unexpected end of request head".to_string(),
        ));
    }
    if line.last() != Some(&b'\n') {
        return Err(ProxyError::Framing(
            "request head too large or truncated".to_string(),
        ));
    }

    raw.extend_from_slice(&line);

    while matches!(line.last(), Some(&b'\n') | Some(&b'\r')) {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| ProxyError::Framing("request head is not valid UTF-8".to_string()))
}

/// Append the default port when the authority does not carry one; IPv6
/// literals are bracketed on the way.
pub fn ensure_port(host: &str, default_port: u16) -> String {
    if host.parse::<std::net::SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return match ip {
            std::net::IpAddr::V6(_) => format!("[{ip}]:{default_port}"),
            std::net::IpAddr::V4(_) => format!("{ip}:{default_port}"),
        };
    }
    if host.starts_with('[') {
        // Bracketed IPv6 without a port.
        return format!("{host}:{default_port}");
    }
    match host.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            host.to_string()
        }
        _ => format!("{host}:{default_port}"),
    }
}
