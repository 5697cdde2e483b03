//! [`ProxyListener`] — owns a set of bound sockets, pipes accepted
//! connections through the [`translator`](crate::translator), and hands
//! finished [`ProxyConn`]s to callers of [`accept`](ProxyListener::accept).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::addr::AddressTag;
use crate::ca::CaCertificate;
use crate::conn::ProxyConn;
use crate::error::{ProxyError, ProxyResult};
use crate::translator::{translate, InputConn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
}

struct ChildListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

/// Accepts connections on any number of bound addresses, runs each one
/// through the translator, and exposes the results through [`accept`].
///
/// [`accept`]: ProxyListener::accept
pub struct ProxyListener {
    state: std::sync::RwLock<ListenerState>,
    ca: Arc<std::sync::RwLock<Arc<CaCertificate>>>,
    children: std::sync::Mutex<HashMap<u64, ChildListener>>,
    next_child_id: AtomicU64,
    input_tx: mpsc::Sender<InputConn>,
    output_rx: AsyncMutex<mpsc::Receiver<ProxyConn>>,
    output_done_tx: watch::Sender<bool>,
    tasks: Arc<std::sync::Mutex<JoinSet<()>>>,
}

impl ProxyListener {
    pub fn new(ca: CaCertificate) -> Self {
        Self::with_capacity(ca, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Like [`new`](Self::new), but with an explicit bound on the
    /// `input_conns`/`output_conns` channel capacity rather than the
    /// built-in default.
    pub fn with_capacity(ca: CaCertificate, capacity: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (output_done_tx, output_done_rx) = watch::channel(false);

        let ca = Arc::new(std::sync::RwLock::new(Arc::new(ca)));
        let tasks = Arc::new(std::sync::Mutex::new(JoinSet::new()));

        let dispatch_fut = dispatch(input_rx, output_tx, output_done_rx, ca.clone(), tasks.clone());
        tasks.lock().expect("tasks lock").spawn(dispatch_fut);

        Self {
            state: std::sync::RwLock::new(ListenerState::Running),
            ca,
            children: std::sync::Mutex::new(HashMap::new()),
            next_child_id: AtomicU64::new(1),
            input_tx,
            output_rx: AsyncMutex::new(output_rx),
            output_done_tx,
            tasks,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read().expect("listener state lock")
    }

    pub fn set_ca_certificate(&self, ca: CaCertificate) {
        *self.ca.write().expect("ca lock") = Arc::new(ca);
    }

    pub fn get_ca_certificate_pem(&self) -> String {
        self.ca.read().expect("ca lock").root_cert_pem()
    }

    /// Bind and start accepting connections whose destination is parsed
    /// from each connection's own first request. Returns an opaque id that
    /// [`remove_listener`](Self::remove_listener) can later use to stop it.
    pub async fn add_listener(&self, bind_addr: SocketAddr) -> io::Result<u64> {
        self.add_listener_inner(bind_addr, None).await
    }

    /// Bind and start accepting connections that always proxy to a fixed
    /// destination, regardless of what each connection's first request asks
    /// for.
    pub async fn add_transparent_listener(&self, bind_addr: SocketAddr, destination: AddressTag) -> io::Result<u64> {
        self.add_listener_inner(bind_addr, Some(destination)).await
    }

    async fn add_listener_inner(&self, bind_addr: SocketAddr, destination_override: Option<AddressTag>) -> io::Result<u64> {
        if self.state() == ListenerState::Stopped {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listener is closed"));
        }

        let tcp_listener = TcpListener::bind(bind_addr).await?;
        let local_addr = tcp_listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let child_id = self.next_child_id.fetch_add(1, Ordering::Relaxed);
        let input_tx = self.input_tx.clone();

        self.tasks
            .lock()
            .expect("tasks lock")
            .spawn(accept_loop(tcp_listener, local_addr, input_tx, shutdown_rx, destination_override));

        self.children
            .lock()
            .expect("children lock")
            .insert(child_id, ChildListener { local_addr, shutdown_tx });

        info!(%local_addr, child_id, "listener bound");
        Ok(child_id)
    }

    /// List the ids of currently registered listeners.
    pub fn list_listener_ids(&self) -> Vec<u64> {
        self.children.lock().expect("children lock").keys().copied().collect()
    }

    /// Stop accepting on a previously added listener. Connections already
    /// accepted are unaffected.
    pub fn remove_listener(&self, id: u64) -> ProxyResult<()> {
        let mut children = self.children.lock().expect("children lock");
        match children.remove(&id) {
            Some(child) => {
                let _ = child.shutdown_tx.send(true);
                info!(child_id = id, local_addr = %child.local_addr, "listener removed");
                Ok(())
            }
            None => Err(ProxyError::ListenerNotFound(id)),
        }
    }

    /// Receive the next fully translated connection.
    pub async fn accept(&self) -> ProxyResult<ProxyConn> {
        if self.state() == ListenerState::Stopped {
            return Err(ProxyError::ListenerClosed);
        }
        let mut output_rx = self.output_rx.lock().await;
        output_rx.recv().await.ok_or(ProxyError::ListenerClosed)
    }

    /// Stop all child listeners and the dispatcher, and wait for in-flight
    /// background tasks to finish. Already-yielded [`ProxyConn`]s are
    /// untouched.
    pub async fn close(&self) {
        *self.state.write().expect("listener state lock") = ListenerState::Stopped;
        let _ = self.output_done_tx.send(true);

        let children: Vec<ChildListener> = self.children.lock().expect("children lock").drain().map(|(_, c)| c).collect();
        for child in &children {
            let _ = child.shutdown_tx.send(true);
        }

        let mut tasks = {
            let mut guard = self.tasks.lock().expect("tasks lock");
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        while tasks.join_next().await.is_some() {}

        debug!("proxy listener closed");
    }
}

async fn accept_loop(
    tcp_listener: TcpListener,
    local_addr: SocketAddr,
    input_tx: mpsc::Sender<InputConn>,
    mut shutdown_rx: watch::Receiver<bool>,
    destination_override: Option<AddressTag>,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = tcp_listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, %local_addr, "accepted connection");
                        let input = InputConn {
                            stream,
                            destination_override: destination_override.clone(),
                        };
                        if input_tx.send(input).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, %local_addr, "accept failed"),
                }
            }
        }
    }
    debug!(%local_addr, "accept loop exiting");
}

/// Pulls [`InputConn`]s off `input_conns`, runs the translator on a fresh
/// task per connection, and forwards successes onto `output_conns`.
/// Translation failures are logged and the connection is dropped; they
/// never reach `accept()`.
async fn dispatch(
    mut input_rx: mpsc::Receiver<InputConn>,
    output_tx: mpsc::Sender<ProxyConn>,
    mut output_done_rx: watch::Receiver<bool>,
    ca: Arc<std::sync::RwLock<Arc<CaCertificate>>>,
    tasks: Arc<std::sync::Mutex<JoinSet<()>>>,
) {
    loop {
        tokio::select! {
            changed = output_done_rx.changed() => {
                if changed.is_err() || *output_done_rx.borrow() {
                    break;
                }
            }
            maybe_input = input_rx.recv() => {
                let Some(input) = maybe_input else { break };
                let ca_snapshot = ca.read().expect("ca lock").clone();
                let output_tx = output_tx.clone();
                let fut = async move {
                    match translate(input, ca_snapshot).await {
                        Ok(conn) => {
                            if output_tx.send(conn).await.is_err() {
                                debug!("translated connection dropped, output channel closed");
                            }
                        }
                        Err(e) => info!(error = %e, "translation failed, dropping connection"),
                    }
                };
                tasks.lock().expect("tasks lock").spawn(fut);
            }
        }
    }
    debug!("dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn new_listener_starts_running() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        assert_eq!(listener.state(), ListenerState::Running);
    }

    #[tokio::test]
    async fn add_listener_resolves_destination_from_request() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let bound = listener.add_listener(loopback()).await.unwrap();
        assert!(bound > 0);

        let children_addr = {
            let children = listener.children.lock().unwrap();
            children.get(&bound).unwrap().local_addr
        };

        let mut client = TcpStream::connect(children_addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.destination(), Some(AddressTag::new("example.com", 80, false)));
    }

    #[tokio::test]
    async fn add_transparent_listener_ignores_request_destination() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let bound = listener
            .add_transparent_listener(loopback(), AddressTag::new("fixed.internal", 5432, false))
            .await
            .unwrap();

        let children_addr = {
            let children = listener.children.lock().unwrap();
            children.get(&bound).unwrap().local_addr
        };

        let mut client = TcpStream::connect(children_addr).await.unwrap();
        client
            .write_all(b"GET http://other.example/path HTTP/1.1\r\nHost: other.example\r\n\r\n")
            .await
            .unwrap();

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.destination(), Some(AddressTag::new("fixed.internal", 5432, false)));
        assert!(conn.is_transparent());
    }

    #[tokio::test]
    async fn list_listener_ids_reflects_additions_and_removals() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let a = listener.add_listener(loopback()).await.unwrap();
        let b = listener.add_listener(loopback()).await.unwrap();

        let mut ids = listener.list_listener_ids();
        ids.sort();
        assert_eq!(ids, vec![a, b]);

        listener.remove_listener(a).unwrap();
        assert_eq!(listener.list_listener_ids(), vec![b]);
    }

    #[tokio::test]
    async fn remove_unknown_listener_fails() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        assert!(matches!(
            listener.remove_listener(9999),
            Err(ProxyError::ListenerNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn remove_listener_stops_new_connections_being_dispatched() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let id = listener.add_listener(loopback()).await.unwrap();
        let addr = {
            let children = listener.children.lock().unwrap();
            children.get(&id).unwrap().local_addr
        };

        listener.remove_listener(id).unwrap();
        // Give the accept loop a moment to observe the shutdown signal.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // The socket is no longer being accepted on; a connect may still
        // succeed at the OS level (backlog) but no translated ProxyConn
        // will ever arrive for it.
        if let Ok(mut client) = TcpStream::connect(addr).await {
            let _ = client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
        }
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), listener.accept()).await;
        assert!(result.is_err(), "no connection should have been dispatched after removal");
    }

    #[tokio::test]
    async fn close_rejects_further_accept_calls() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        listener.close().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(matches!(listener.accept().await, Err(ProxyError::ListenerClosed)));
    }

    #[tokio::test]
    async fn set_ca_certificate_changes_the_root_pem() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let first_pem = listener.get_ca_certificate_pem();
        listener.set_ca_certificate(CaCertificate::generate().unwrap());
        let second_pem = listener.get_ca_certificate_pem();
        assert_ne!(first_pem, second_pem);
    }

    #[tokio::test]
    async fn read_after_connect_handshake_round_trips_replayed_plaintext() {
        let listener = ProxyListener::new(CaCertificate::generate().unwrap());
        let id = listener.add_listener(loopback()).await.unwrap();
        let addr = {
            let children = listener.children.lock().unwrap();
            children.get(&id).unwrap().local_addr
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        client.write_all(request).await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        let mut buf = vec![0u8; request.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, request);
    }
}
