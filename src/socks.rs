use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

pub const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// `VER REP RSV ATYP BND.ADDR BND.PORT` with zeroed IPv4 bind fields.
const REPLY_SUCCEEDED: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_HOST_UNREACHABLE: [u8; 10] = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Run the SOCKS5 CONNECT negotiation up to (not including) the final
/// reply, returning the requested `host:port` target.
///
/// Method selection always answers no-auth, whatever the client offered.
/// Unsupported commands and malformed frames close the connection without a
/// reply and without dialing anything.
pub async fn handshake<R, W>(reader: &mut R, writer: &mut W) -> ProxyResult<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let version = reader.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(ProxyError::Framing(format!(
            "unsupported SOCKS version {version:#04x}"
        )));
    }

    let n_methods = reader.read_u8().await? as usize;
    let mut methods = vec![0u8; n_methods];
    reader.read_exact(&mut methods).await?;

    writer
        .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
        .await?;

    let mut request = [0u8; 4];
    reader.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ProxyError::Framing(format!(
            "bad version {:#04x} in request header",
            request[0]
        )));
    }
    if request[1] != CMD_CONNECT {
        return Err(ProxyError::Unsupported(format!(
            "SOCKS5 command {:#04x}",
            request[1]
        )));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            if len == 0 {
                return Err(ProxyError::Framing("empty domain name".to_string()));
            }
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain)
                .map_err(|_| ProxyError::Framing("domain name is not valid UTF-8".to_string()))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(ProxyError::Unsupported(format!(
                "SOCKS5 address type {other:#04x}"
            )));
        }
    };

    let port = reader.read_u16().await?;
    Ok(host_port(&host, port))
}

/// Write the final CONNECT reply: success or host-unreachable.
pub async fn write_reply<W>(writer: &mut W, success: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = if success {
        &REPLY_SUCCEEDED
    } else {
        &REPLY_HOST_UNREACHABLE
    };
    writer.write_all(reply).await
}

/// Compose `host:port`, bracketing IPv6 literals.
pub fn host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};

    /// Drive `handshake` against scripted client bytes; returns the result
    /// plus whatever the engine wrote back.
    async fn run_handshake(client_bytes: &[u8]) -> (ProxyResult<String>, Vec<u8>) {
        let (mut client, server) = duplex(1024);
        client.write_all(client_bytes).await.unwrap();

        let (mut reader, mut writer) = split(server);
        let result = handshake(&mut reader, &mut writer).await;
        drop(writer);
        drop(reader);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn connect_with_ipv4_address() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90]);

        let (result, replies) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "127.0.0.1:8080");
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn connect_with_domain() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 0x0b]);
        bytes.extend_from_slice(b"example.com");
        bytes.extend_from_slice(&[0x00, 0x50]);

        let (result, replies) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "example.com:80");
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn connect_with_ipv6_address() {
        let mut bytes = vec![0x05, 0x02, 0x00, 0x02];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        let mut addr = [0u8; 16];
        addr[15] = 1;
        bytes.extend_from_slice(&addr);
        bytes.extend_from_slice(&[0x01, 0xbb]);

        let (result, _) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "[::1]:443");
    }

    #[tokio::test]
    async fn no_auth_selected_even_when_not_offered() {
        // Client offers only username/password (0x02); the engine still
        // selects no-auth.
        let mut bytes = vec![0x05, 0x01, 0x02];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50]);

        let (result, replies) = run_handshake(&bytes).await;
        assert_eq!(result.unwrap(), "10.0.0.1:80");
        assert_eq!(&replies[..2], &[0x05, 0x00]);
    }

    #[tokio::test]
    async fn empty_domain_is_a_framing_error() {
        let bytes = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 0x00, 0x00, 0x50];

        let (result, _) = run_handshake(&bytes).await;
        assert!(matches!(result, Err(ProxyError::Framing(_))));
    }

    #[tokio::test]
    async fn bind_and_udp_associate_are_rejected() {
        for cmd in [0x02u8, 0x03u8] {
            let bytes = vec![0x05, 0x01, 0x00, 0x05, cmd, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50];
            let (result, replies) = run_handshake(&bytes).await;
            assert!(matches!(result, Err(ProxyError::Unsupported(_))));
            // The method reply went out but no connect reply follows.
            assert_eq!(replies, vec![0x05, 0x00]);
        }
    }

    #[tokio::test]
    async fn unknown_address_type_is_rejected() {
        let bytes = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x08, 1, 2, 3, 4, 0x00, 0x50];
        let (result, _) = run_handshake(&bytes).await;
        assert!(matches!(result, Err(ProxyError::Unsupported(_))));
    }

    #[tokio::test]
    async fn bad_version_is_rejected() {
        let (result, replies) = run_handshake(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(ProxyError::Framing(_))));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn reply_bytes_are_exact() {
        let (client, server) = duplex(64);
        let (_, mut writer) = split(server);

        write_reply(&mut writer, true).await.unwrap();
        write_reply(&mut writer, false).await.unwrap();
        drop(writer);

        let (mut client_reader, _) = split(client);
        let mut replies = Vec::new();
        client_reader.read_to_end(&mut replies).await.unwrap();
        assert_eq!(
            replies,
            vec![
                0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, //
                0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn host_port_brackets_ipv6() {
        assert_eq!(host_port("example.com", 80), "example.com:80");
        assert_eq!(host_port("127.0.0.1", 8080), "127.0.0.1:8080");
        assert_eq!(host_port("::1", 443), "[::1]:443");
        assert_eq!(host_port("2001:db8::1", 80), "[2001:db8::1]:80");
    }
}
