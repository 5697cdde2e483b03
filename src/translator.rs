//! The translator — the per-connection state machine that turns a freshly
//! accepted socket into a [`ProxyConn`] with a resolved destination.
//!
//! It reads the first HTTP/1.x request off the wire, answers CONNECT
//! requests with `200 Connection established` and hands the caller a
//! TLS-sniffed tunnel, or replays the request bytes ahead of a plain
//! passthrough connection. Either way the destination ends up addressable
//! through [`ProxyConn::destination`].

use std::io;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::info;

use crate::addr::AddressTag;
use crate::ca::CaCertificate;
use crate::conn::ProxyConn;
use crate::error::{ProxyError, ProxyResult};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// A socket accepted by a listener, not yet wrapped in a [`ProxyConn`].
///
/// `destination_override` carries the fixed address configured by
/// `add_transparent_listener`; when set, the translator still runs the
/// CONNECT/TLS-sniff logic but leaves the destination alone.
pub struct InputConn {
    pub stream: TcpStream,
    pub destination_override: Option<AddressTag>,
}

struct ParsedRequest {
    method: String,
    target: String,
    host_header: Option<String>,
}

/// Run the translation state machine for one accepted connection, producing
/// a [`ProxyConn`] with a resolved destination (unless translation fails).
pub async fn translate(input: InputConn, ca: Arc<CaCertificate>) -> ProxyResult<ProxyConn> {
    let InputConn {
        stream,
        destination_override,
    } = input;

    let (parsed, raw_bytes, mut stream) = read_first_request(stream).await?;
    let is_connect = parsed.method == "CONNECT";

    let placeholder = destination_override
        .clone()
        .unwrap_or_else(|| AddressTag::new(String::new(), 0, false));
    let transparent = destination_override.is_some();

    let (host, port_from_url, use_tls, conn) = if is_connect {
        let (host, port) = split_host_port(&parsed.target)?;
        stream
            .write_all(CONNECT_RESPONSE)
            .await
            .map_err(ProxyError::ConnectResponseWriteFailed)?;

        let mut conn = ProxyConn::new(stream, placeholder, transparent, ca);
        let tls_started = conn.start_maybe_tls(&host).await?;
        (host, port, tls_started, conn)
    } else {
        let host_source = extract_absolute_authority(&parsed.target)
            .map(str::to_string)
            .or_else(|| parsed.host_header.clone())
            .ok_or_else(|| ProxyError::HostnameParseFailed(parsed.target.clone()))?;
        let (host, port) = split_host_port(&host_source)?;

        let mut conn = ProxyConn::new(stream, placeholder, transparent, ca);
        conn.return_request(raw_bytes);
        (host, port, false, conn)
    };

    if !transparent {
        let port = port_from_url.unwrap_or(if use_tls { 443 } else { 80 });
        conn.set_destination(AddressTag::new(host, port, use_tls));
    }

    info!(connect = is_connect, tls = use_tls, "translated connection");
    Ok(conn)
}

/// Read bytes off `stream` until a full set of request headers has arrived,
/// parse the request line and `Host` header, and hand back both the parsed
/// fields and the raw bytes read (which may include pipelined bytes past
/// the headers) so they can be replayed verbatim.
async fn read_first_request(mut stream: TcpStream) -> ProxyResult<(ParsedRequest, Vec<u8>, TcpStream)> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut tmp).await.map_err(ProxyError::ReadRequestFailed)?;
        if n == 0 {
            return Err(ProxyError::ReadRequestFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before a full request was read",
            )));
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::ReadRequestFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                "request headers exceeded the size cap",
            )));
        }
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = &buf[..header_end];
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_storage);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::ReadRequestFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete request",
            )));
        }
        Err(e) => {
            return Err(ProxyError::ReadRequestFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                e.to_string(),
            )));
        }
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::ReadRequestFailed(io::Error::new(io::ErrorKind::InvalidData, "missing method")))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ProxyError::ReadRequestFailed(io::Error::new(io::ErrorKind::InvalidData, "missing request target")))?
        .to_string();
    let host_header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string());

    Ok((
        ParsedRequest {
            method,
            target,
            host_header,
        },
        buf,
        stream,
    ))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pull the `host[:port]` authority out of an absolute-form request target
/// (`http://host:port/path`), if the target is in that form.
fn extract_absolute_authority(target: &str) -> Option<&str> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Split `host[:port]` on the first colon. No colon means no port was
/// specified; a non-numeric port is a parse failure.
fn split_host_port(hostport: &str) -> ProxyResult<(String, Option<u16>)> {
    match hostport.split_once(':') {
        None => Ok((hostport.to_string(), None)),
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::HostnameParseFailed(hostport.to_string()))?;
            Ok((host.to_string(), Some(port)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        let client = connect.await.unwrap();
        (server, client)
    }

    #[test]
    fn split_host_port_without_port() {
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".to_string(), None));
    }

    #[test]
    fn split_host_port_with_port() {
        assert_eq!(
            split_host_port("example.com:8443").unwrap(),
            ("example.com".to_string(), Some(8443))
        );
    }

    #[test]
    fn split_host_port_rejects_non_numeric_port() {
        assert!(split_host_port("example.com:https").is_err());
    }

    #[test]
    fn extract_absolute_authority_strips_scheme_and_path() {
        assert_eq!(
            extract_absolute_authority("http://example.com:8080/path?x=1"),
            Some("example.com:8080")
        );
        assert_eq!(extract_absolute_authority("/relative/path"), None);
    }

    #[tokio::test]
    async fn connect_request_gets_established_response_and_resolved_destination() {
        let (server, mut client) = loopback_pair().await;
        let ca = Arc::new(CaCertificate::generate().unwrap());

        // Runs concurrently with `translate` below: `start_maybe_tls` peeks a
        // byte after the CONNECT response is written, so the client has to
        // be driven from its own task rather than sequenced after `translate`
        // returns, or the peek would block forever waiting on a byte nobody
        // sends yet.
        let client_task = tokio::spawn(async move {
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await
                .unwrap();

            let mut resp = vec![0u8; CONNECT_RESPONSE.len()];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, CONNECT_RESPONSE);

            client.write_all(b"G").await.unwrap();
        });

        let input = InputConn {
            stream: server,
            destination_override: None,
        };
        let conn = translate(input, ca).await.unwrap();
        assert_eq!(
            conn.destination(),
            Some(AddressTag::new("example.com", 443, false))
        );

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn plain_request_resolves_destination_from_absolute_target() {
        let (server, mut client) = loopback_pair().await;
        let ca = Arc::new(CaCertificate::generate().unwrap());

        client
            .write_all(b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let input = InputConn {
            stream: server,
            destination_override: None,
        };
        let mut conn = translate(input, ca).await.unwrap();
        assert_eq!(
            conn.destination(),
            Some(AddressTag::new("example.com", 80, false))
        );

        let mut replayed = vec![0u8; b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n".len()];
        conn.read_exact(&mut replayed).await.unwrap();
        assert_eq!(&replayed, b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[tokio::test]
    async fn plain_request_falls_back_to_host_header_for_origin_form() {
        let (server, mut client) = loopback_pair().await;
        let ca = Arc::new(CaCertificate::generate().unwrap());

        client
            .write_all(b"GET /path HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .await
            .unwrap();

        let input = InputConn {
            stream: server,
            destination_override: None,
        };
        let conn = translate(input, ca).await.unwrap();
        assert_eq!(
            conn.destination(),
            Some(AddressTag::new("example.com", 8080, false))
        );
    }

    #[tokio::test]
    async fn transparent_destination_is_left_alone() {
        let (server, mut client) = loopback_pair().await;
        let ca = Arc::new(CaCertificate::generate().unwrap());

        client
            .write_all(b"GET http://other.example/path HTTP/1.1\r\nHost: other.example\r\n\r\n")
            .await
            .unwrap();

        let input = InputConn {
            stream: server,
            destination_override: Some(AddressTag::new("fixed.internal", 5432, false)),
        };
        let conn = translate(input, ca).await.unwrap();
        assert_eq!(
            conn.destination(),
            Some(AddressTag::new("fixed.internal", 5432, false))
        );
        assert!(conn.is_transparent());
    }
}
