//! [`ProxyConn`] — a client connection wrapped so the rest of the stack can
//! treat CONNECT tunnels, opportunistically-TLS-terminated connections, and
//! plain replayed connections through one `AsyncRead`/`AsyncWrite` surface.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::addr::AddressTag;
use crate::ca::CaCertificate;
use crate::error::{ProxyError, ProxyResult};
use crate::peek::PeekableStream;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The inner byte stream a [`ProxyConn`] is currently backed by.
///
/// A connection starts `Raw`. [`ProxyConn::start_maybe_tls`] replaces it
/// with either `Peeked` (the sniffed byte turned out not to be a TLS
/// handshake, so the peek buffer stays in front of the raw socket) or `Tls`
/// (a terminated TLS session wrapping the peeked socket).
enum InnerStream {
    Raw(TcpStream),
    Peeked(PeekableStream<TcpStream>),
    Tls(Box<TlsStream<PeekableStream<TcpStream>>>),
}

/// Bytes already pulled off the wire while parsing the first request, to be
/// handed back to the next reader before anything new arrives from the
/// network.
///
/// Tracked with a cursor rather than truncated to a single read's buffer
/// size, so a replay longer than one caller-sized read still delivers in
/// full across several reads.
struct ReplayBuffer {
    data: Vec<u8>,
    pos: usize,
}

struct ConnMeta {
    addr: Option<AddressTag>,
    transparent_mode: bool,
}

/// A single accepted connection as it moves through the proxy: CONNECT
/// tunnel, opportunistic TLS termination, or a plain stream with its first
/// request replayed ahead of the rest of the bytes.
pub struct ProxyConn {
    id: u64,
    inner: Option<InnerStream>,
    replay: Option<ReplayBuffer>,
    meta: std::sync::Mutex<ConnMeta>,
    ca: Arc<CaCertificate>,
}

impl ProxyConn {
    pub fn new(stream: TcpStream, addr: AddressTag, transparent_mode: bool, ca: Arc<CaCertificate>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            inner: Some(InnerStream::Raw(stream)),
            replay: None,
            meta: std::sync::Mutex::new(ConnMeta {
                addr: Some(addr),
                transparent_mode,
            }),
            ca,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The resolved destination, if one has been set. `None` only before
    /// translation completes, or after [`end_transparent_mode`] clears it.
    ///
    /// [`end_transparent_mode`]: ProxyConn::end_transparent_mode
    pub fn destination(&self) -> Option<AddressTag> {
        self.meta.lock().expect("proxy conn meta lock").addr.clone()
    }

    /// The destination rendered as a `host/port/tlsbit` tag, or an empty
    /// string if no destination has been resolved yet.
    pub fn remote_addr_tag(&self) -> String {
        self.destination().map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn is_transparent(&self) -> bool {
        self.meta.lock().expect("proxy conn meta lock").transparent_mode
    }

    /// Set the resolved destination directly, leaving transparent mode
    /// untouched. Used by the translator once it has parsed a non-transparent
    /// request's destination.
    pub fn set_destination(&self, addr: AddressTag) {
        self.meta.lock().expect("proxy conn meta lock").addr = Some(addr);
    }

    /// Install a destination ahead of any request parsing and mark this
    /// connection as transparent, so the translator leaves the destination
    /// alone once it runs.
    pub fn set_transparent_mode(&self, host: impl Into<String>, port: u16, use_tls: bool) {
        let mut meta = self.meta.lock().expect("proxy conn meta lock");
        meta.addr = Some(AddressTag::new(host, port, use_tls));
        meta.transparent_mode = true;
    }

    /// Turn off transparent mode. Also clears the installed destination,
    /// since a connection leaving transparent mode has no resolved
    /// destination left to fall back to.
    pub fn end_transparent_mode(&self) {
        let mut meta = self.meta.lock().expect("proxy conn meta lock");
        meta.transparent_mode = false;
        meta.addr = None;
    }

    /// Queue raw bytes already read off the wire to be delivered to the next
    /// reader before anything new arrives from the network.
    pub fn return_request(&mut self, raw_request_bytes: Vec<u8>) {
        self.replay = Some(ReplayBuffer {
            data: raw_request_bytes,
            pos: 0,
        });
    }

    /// Sniff the next byte on the wire; if it looks like a TLS handshake,
    /// terminate TLS using a leaf certificate minted for `hostname`.
    /// Returns whether TLS was started.
    pub async fn start_maybe_tls(&mut self, hostname: &str) -> ProxyResult<bool> {
        let raw = match self.inner.take() {
            Some(InnerStream::Raw(stream)) => stream,
            other => {
                self.inner = other;
                return Err(ProxyError::InactiveConnection);
            }
        };

        let mut peekable = PeekableStream::new(raw);
        let first = peekable.peek(1).await.map_err(ProxyError::TlsSniffFailed)?;
        let is_tls = first.first() == Some(&0x16);

        if !is_tls {
            debug!(%hostname, "connection is not TLS, passing through");
            self.inner = Some(InnerStream::Peeked(peekable));
            return Ok(false);
        }

        let leaf = self.ca.sign_host(&[hostname.to_string()])?;
        let server_config = rustls::ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![leaf.cert_der], leaf.key_der)
        .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;

        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = acceptor
            .accept(peekable)
            .await
            .map_err(|e| ProxyError::CertificateSigningFailed(e.to_string()))?;

        debug!(%hostname, "terminated TLS for intercepted connection");
        self.inner = Some(InnerStream::Tls(Box::new(tls_stream)));
        Ok(true)
    }

    fn tcp_ref(&self) -> Option<&TcpStream> {
        match self.inner.as_ref()? {
            InnerStream::Raw(s) => Some(s),
            InnerStream::Peeked(p) => Some(p.get_ref()),
            InnerStream::Tls(t) => Some(t.get_ref().0.get_ref()),
        }
    }

    /// Local address of the underlying socket; delegates straight to the
    /// inner stream regardless of which state it's in.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "inactive proxy connection"))?
            .local_addr()
    }

    pub async fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        tokio::time::timeout(timeout, AsyncReadExt::read(self, buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
    }

    pub async fn write_with_timeout(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        tokio::time::timeout(timeout, AsyncWriteExt::write(self, buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
    }

    pub async fn close(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

impl AsyncRead for ProxyConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(replay) = this.replay.as_mut() {
            let remaining = &replay.data[replay.pos..];
            if !remaining.is_empty() {
                let n = buf.remaining().min(remaining.len());
                buf.put_slice(&remaining[..n]);
                replay.pos += n;
                if replay.pos >= replay.data.len() {
                    this.replay = None;
                }
                return Poll::Ready(Ok(()));
            }
            this.replay = None;
        }

        match this.inner.as_mut() {
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "read attempted on a connection with no active inner stream",
            ))),
            Some(InnerStream::Raw(s)) => Pin::new(s).poll_read(cx, buf),
            Some(InnerStream::Peeked(p)) => Pin::new(p).poll_read(cx, buf),
            Some(InnerStream::Tls(t)) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write attempted on a connection with no active inner stream",
            ))),
            Some(InnerStream::Raw(s)) => Pin::new(s).poll_write(cx, buf),
            Some(InnerStream::Peeked(p)) => Pin::new(p).poll_write(cx, buf),
            Some(InnerStream::Tls(t)) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(InnerStream::Raw(s)) => Pin::new(s).poll_flush(cx),
            Some(InnerStream::Peeked(p)) => Pin::new(p).poll_flush(cx),
            Some(InnerStream::Tls(t)) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(InnerStream::Raw(s)) => Pin::new(s).poll_shutdown(cx),
            Some(InnerStream::Peeked(p)) => Pin::new(p).poll_shutdown(cx),
            Some(InnerStream::Tls(t)) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}
