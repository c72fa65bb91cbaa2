//! Query server: the inbound endpoint of a worker
//!
//! The server owns two event loop groups. The accept group runs the accept
//! loop and the memory guardian; the I/O group multiplexes every accepted
//! connection. Each connection is set up in a fixed order: memory guardian
//! hook (buffer account and registry entry), TLS, frame codec, then the
//! injected [`RequestHandler`].

use crate::backend::IoBackend;
use crate::codec::FrameCodec;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::guardian::{AcceptGate, MemoryGuardian};
use crate::handler::{ConnectionContext, RequestHandler};
use crate::memory::{BufferAccount, MemoryKind, PooledAllocator};
use crate::registry::ConnectionRegistry;
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Longest wait for the accept loop to drop the listening socket
const ACCEPT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

struct EventLoops {
    accept: Runtime,
    io: Runtime,
}

struct Running {
    local_addr: SocketAddr,
    accept_stopped: mpsc::Receiver<()>,
}

/// State shared by every connection task
struct ConnectionShared {
    handler: Arc<dyn RequestHandler>,
    registry: Arc<ConnectionRegistry>,
    guardian: Arc<MemoryGuardian>,
    tls: Option<TlsAcceptor>,
    max_frame_length: usize,
    handshake_timeout: Duration,
    tcp_keepalive: bool,
    tcp_nodelay: bool,
    shutdown: CancellationToken,
}

/// Length-prefixed frame server for a query worker
///
/// # Example
///
/// ```no_run
/// use query_transport::{PooledAllocator, QueryServer, TransportConfig};
/// # use query_transport::{ConnectionContext, RequestHandler, Result};
/// # use std::sync::Arc;
/// # struct Handler;
/// # #[async_trait::async_trait]
/// # impl RequestHandler for Handler {
/// #     async fn handle(&self, _: &ConnectionContext, _: bytes::Bytes) -> Result<Option<bytes::Bytes>> { Ok(None) }
/// # }
///
/// let config = TransportConfig::new(8098);
/// let allocator = PooledAllocator::new(config.allocator.clone());
/// let mut server = QueryServer::new(config, allocator, Arc::new(Handler))?;
/// let addr = server.start()?;
/// println!("listening on {}", addr);
/// server.shutdown()?;
/// # Ok::<(), query_transport::TransportError>(())
/// ```
pub struct QueryServer {
    config: TransportConfig,
    backend: IoBackend,
    handler: Arc<dyn RequestHandler>,
    allocator: Arc<PooledAllocator>,
    registry: Arc<ConnectionRegistry>,
    guardian: Arc<MemoryGuardian>,
    event_loops: Option<EventLoops>,
    running: Option<Running>,
    connections: TaskTracker,
    shutdown: CancellationToken,
}

impl QueryServer {
    /// Create a server and its event loop groups
    ///
    /// Nothing is bound until [`start`](Self::start) is called.
    pub fn new(
        config: TransportConfig,
        allocator: Arc<PooledAllocator>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let backend = IoBackend::negotiate(config.native_transport_enabled);
        let registry = ConnectionRegistry::new();
        let guardian = MemoryGuardian::new(
            config.guardian.clone(),
            Arc::clone(&allocator),
            Arc::clone(&registry),
        )?;

        let accept = backend.event_loop_group("accept", config.accept_threads)?;
        let io = match backend.event_loop_group("io", config.io_threads) {
            Ok(io) => io,
            Err(e) => {
                accept.shutdown_background();
                return Err(e);
            }
        };

        Ok(Self {
            config,
            backend,
            handler,
            allocator,
            registry,
            guardian,
            event_loops: Some(EventLoops { accept, io }),
            running: None,
            connections: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the listening socket and start accepting
    ///
    /// Returns the bound address. On failure every event loop is released
    /// and the server cannot be started again.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        if self.event_loops.is_none() {
            return Err(released());
        }

        let tls = match &self.config.tls {
            Some(tls_config) => match tls_config.create_acceptor() {
                Ok(acceptor) => {
                    info!("TLS encryption is ENABLED");
                    Some(acceptor)
                }
                Err(e) => {
                    error!("Failed to create TLS acceptor: {}", e);
                    self.release_event_loops();
                    return Err(e);
                }
            },
            None => {
                warn!("TLS encryption is DISABLED");
                None
            }
        };

        let addr = self.config.bind_addr();
        let bound = match &self.event_loops {
            Some(loops) => {
                let _guard = loops.accept.enter();
                bind_listener(&addr, self.config.accept_backlog)
            }
            None => Err(released()),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("{}", e);
                self.release_event_loops();
                return Err(e);
            }
        };

        let shared = Arc::new(ConnectionShared {
            handler: Arc::clone(&self.handler),
            registry: Arc::clone(&self.registry),
            guardian: Arc::clone(&self.guardian),
            tls,
            max_frame_length: self.config.max_frame_length,
            handshake_timeout: self.config.handshake_timeout(),
            tcp_keepalive: self.config.tcp_keepalive,
            tcp_nodelay: self.config.tcp_nodelay,
            shutdown: self.shutdown.clone(),
        });

        let (stopped_tx, stopped_rx) = mpsc::channel();
        if let Some(loops) = &self.event_loops {
            loops
                .accept
                .spawn(Arc::clone(&self.guardian).run(self.shutdown.clone()));
            loops.accept.spawn(accept_loop(
                listener,
                shared,
                self.guardian.gate(),
                loops.io.handle().clone(),
                self.connections.clone(),
                stopped_tx,
            ));
        }

        info!(
            "Query server listening on {} ({} event loop)",
            local_addr, self.backend
        );
        self.running = Some(Running {
            local_addr,
            accept_stopped: stopped_rx,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close the listening socket and release event loops
    ///
    /// Event loops are released even when the listening socket fails to
    /// close in time; that failure is still reported.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            self.release_event_loops();
            return Ok(());
        };

        info!("Shutting down query server on {}", running.local_addr);
        self.shutdown.cancel();

        let closed = match running.accept_stopped.recv_timeout(ACCEPT_STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(ACCEPT_STOP_TIMEOUT)),
        };
        if let Err(e) = &closed {
            error!("Listening socket did not close: {}", e);
        }

        self.release_event_loops();
        closed
    }

    fn release_event_loops(&mut self) {
        let Some(loops) = self.event_loops.take() else {
            return;
        };
        self.shutdown.cancel();
        self.connections.close();

        let grace = self.config.shutdown_grace();
        // Blocking on a runtime is not allowed from inside another one
        if grace.is_zero() || Handle::try_current().is_ok() {
            loops.accept.shutdown_background();
            loops.io.shutdown_background();
        } else {
            let tracker = self.connections.clone();
            let drained = loops
                .io
                .block_on(async move { tokio::time::timeout(grace, tracker.wait()).await });
            if drained.is_err() {
                warn!(
                    "{} connections still open after {:?}, abandoning them",
                    self.connections.len(),
                    grace
                );
            }
            loops.accept.shutdown_timeout(grace);
            loops.io.shutdown_timeout(grace);
        }
        debug!("Event loops released");
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Whether the server is accepting connections
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Get the negotiated I/O backend
    pub fn io_backend(&self) -> IoBackend {
        self.backend
    }

    /// Get the server configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Get the live connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the memory guardian
    pub fn guardian(&self) -> &Arc<MemoryGuardian> {
        &self.guardian
    }

    /// Get the pooled allocator
    pub fn allocator(&self) -> &Arc<PooledAllocator> {
        &self.allocator
    }
}

impl Drop for QueryServer {
    fn drop(&mut self) {
        if self.running.is_some() || self.event_loops.is_some() {
            let _ = self.shutdown();
        }
    }
}

fn released() -> TransportError {
    TransportError::Runtime("event loops already released".to_string())
}

/// Bind with an explicit backlog; must run inside the accept runtime
fn bind_listener(addr: &str, backlog: u32) -> Result<(TcpListener, SocketAddr)> {
    let bind_err = |source: std::io::Error| TransportError::Bind {
        addr: addr.to_string(),
        source,
    };

    let sock_addr = addr
        .to_socket_addrs()
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| {
            bind_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address resolved to nothing",
            ))
        })?;

    let socket = Socket::new(
        Domain::for_address(sock_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&sock_addr.into()).map_err(bind_err)?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_err)?;

    let listener = TcpListener::from_std(socket.into()).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;
    Ok((listener, local_addr))
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ConnectionShared>,
    gate: Arc<AcceptGate>,
    io: Handle,
    connections: TaskTracker,
    stopped: mpsc::Sender<()>,
) {
    let shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = gate.wait_open() => {}
        }

        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        debug!("Accepted connection from {}", peer_addr);
        connections.spawn_on(
            serve_connection(stream, peer_addr, Arc::clone(&shared)),
            &io,
        );
    }

    drop(listener);
    info!("Stopped accepting connections");
    let _ = stopped.send(());
}

fn configure_socket(stream: &TcpStream, shared: &ConnectionShared) {
    if let Err(e) = stream.set_nodelay(shared.tcp_nodelay) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if shared.tcp_keepalive {
        if let Err(e) = SockRef::from(stream).set_keepalive(true) {
            warn!("Failed to enable keep-alive: {}", e);
        }
    }
}

async fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, shared: Arc<ConnectionShared>) {
    configure_socket(&stream, &shared);

    let account = shared.guardian.account();
    let registration = shared
        .registry
        .register(peer_addr, account.usage(), shared.tls.is_some());
    let ctx = ConnectionContext {
        id: registration.id(),
        peer_addr,
        tls: shared.tls.is_some(),
    };
    let close = registration.close_token().clone();

    let outcome = tokio::select! {
        _ = close.cancelled() => {
            warn!("Connection {} from {} closed by memory guardian", ctx.id, peer_addr);
            Ok(())
        }
        result = serve_stream(stream, account, &ctx, &shared) => result,
    };

    match outcome {
        Ok(()) => debug!("Connection {} from {} closed", ctx.id, peer_addr),
        Err(e) if e.is_resource_exhausted() => {
            warn!("Connection {} from {} shed: {}", ctx.id, peer_addr, e);
            shared.guardian.check();
        }
        Err(e) => warn!("Connection {} from {} failed: {}", ctx.id, peer_addr, e),
    }
    drop(registration);
}

async fn serve_stream(
    stream: TcpStream,
    account: BufferAccount,
    ctx: &ConnectionContext,
    shared: &ConnectionShared,
) -> Result<()> {
    match &shared.tls {
        Some(acceptor) => {
            let tls_stream = tokio::time::timeout(shared.handshake_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| TransportError::Timeout(shared.handshake_timeout))?
                .map_err(|e| TransportError::Tls(format!("handshake failed: {}", e)))?;
            serve_frames(tls_stream, account, ctx, shared).await
        }
        None => serve_frames(stream, account, ctx, shared).await,
    }
}

async fn serve_frames<S>(
    stream: S,
    account: BufferAccount,
    ctx: &ConnectionContext,
    shared: &ConnectionShared,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = FrameCodec::new()
        .with_max_frame_length(shared.max_frame_length)
        .with_account(account);
    let mut framed = Framed::new(stream, codec);

    loop {
        // Shutdown is only observed between frames
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = framed.next() => match next {
                Some(frame) => frame?,
                None => break,
            },
        };

        let len = frame.len();
        if let Some(account) = framed.codec().account() {
            account.grow(MemoryKind::Heap, len)?;
        }
        let reply = shared.handler.handle(ctx, frame).await;
        if let Some(account) = framed.codec().account() {
            account.shrink(MemoryKind::Heap, len);
        }

        if let Some(reply) = reply? {
            framed.send(reply).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{connect, ConnectOptions};
    use crate::guardian::GuardianConfig;
    use crate::tls::test_support::TestCert;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::io::{Read, Write};
    use std::time::Instant;

    /// Records every frame and optionally echoes it back
    struct Recorder {
        tx: Mutex<mpsc::Sender<Bytes>>,
        echo: bool,
    }

    #[async_trait]
    impl RequestHandler for Recorder {
        async fn handle(&self, _ctx: &ConnectionContext, frame: Bytes) -> Result<Option<Bytes>> {
            let _ = self.tx.lock().send(frame.clone());
            Ok(self.echo.then_some(frame))
        }
    }

    fn recorder(echo: bool) -> (Arc<Recorder>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Recorder {
                tx: Mutex::new(tx),
                echo,
            }),
            rx,
        )
    }

    fn local_config() -> TransportConfig {
        TransportConfig::new(0)
            .with_host("127.0.0.1")
            .with_io_threads(2)
    }

    fn start(config: TransportConfig, handler: Arc<dyn RequestHandler>) -> QueryServer {
        let allocator = PooledAllocator::new(config.allocator.clone());
        let mut server = QueryServer::new(config, allocator, handler).unwrap();
        server.start().unwrap();
        server
    }

    fn write_frame(stream: &mut std::net::TcpStream, payload: &[u8]) {
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .unwrap();
        stream.write_all(payload).unwrap();
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_frame_reaches_handler_unmodified() {
        let (handler, frames) = recorder(false);
        let mut server = start(local_config(), handler);
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        write_frame(&mut client, &payload);

        let received = frames.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(received.len(), payload.len());
        assert_eq!(&received[..], &payload[..]);

        server.shutdown().unwrap();
        assert!(!server.is_running());
    }

    #[test]
    fn test_frames_keep_order_and_replies_are_framed() {
        let (handler, frames) = recorder(true);
        let mut server = start(local_config(), handler);

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        for payload in [&b"first"[..], b"second", b""] {
            write_frame(&mut client, payload);
        }

        for expected in [&b"first"[..], b"second", b""] {
            let frame = frames.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(&frame[..], expected);

            let mut len = [0u8; 4];
            client.read_exact(&mut len).unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
            client.read_exact(&mut body).unwrap();
            assert_eq!(&body[..], expected);
        }

        server.shutdown().unwrap();
    }

    #[test]
    fn test_bind_failure_releases_event_loops() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let config = TransportConfig::new(port).with_host("127.0.0.1");
        let allocator = PooledAllocator::new(config.allocator.clone());
        let (handler, _frames) = recorder(false);
        let mut server = QueryServer::new(config, allocator, handler).unwrap();

        assert!(matches!(server.start(), Err(TransportError::Bind { .. })));
        assert!(!server.is_running());
        assert!(matches!(server.start(), Err(TransportError::Runtime(_))));
        assert!(server.shutdown().is_ok());
    }

    #[test]
    fn test_start_twice_rejected() {
        let (handler, _frames) = recorder(false);
        let mut server = start(local_config(), handler);
        assert!(matches!(server.start(), Err(TransportError::AlreadyStarted)));
        server.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_closes_listening_socket() {
        let (handler, _frames) = recorder(false);
        let mut server = start(local_config(), handler);
        let addr = server.local_addr().unwrap();

        server.shutdown().unwrap();
        assert!(std::net::TcpStream::connect(addr).is_err());
        assert!(server.shutdown().is_ok());
    }

    #[test]
    fn test_shutdown_with_grace_period() {
        let (handler, frames) = recorder(false);
        let config = local_config().with_shutdown_grace(Duration::from_millis(200));
        let mut server = start(config, handler);

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        write_frame(&mut client, b"ping");
        frames.recv_timeout(Duration::from_secs(5)).unwrap();

        server.shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let (handler, frames) = recorder(false);
        let mut server = start(local_config().with_max_frame_length(16), handler);

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write_frame(&mut client, &[7u8; 64]);

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(frames.try_recv().is_err());
        assert!(wait_until(Duration::from_secs(5), || server
            .registry()
            .is_empty()));

        server.shutdown().unwrap();
    }

    #[test]
    fn test_guardian_sheds_buffering_connection() {
        let guardian = GuardianConfig::new(64 * 1024, 32 * 1024)
            .with_check_interval(Duration::from_millis(20));
        let (handler, frames) = recorder(false);
        let mut server = start(local_config().with_guardian(guardian), handler);

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        // Announce a 1 MiB frame and stall after a partial body
        client.write_all(&(1024u32 * 1024).to_be_bytes()).unwrap();
        client.write_all(&[1u8; 1024]).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(frames.try_recv().is_err());
        assert!(wait_until(Duration::from_secs(5), || server
            .guardian()
            .stats()
            .connections_shed
            >= 1));
        assert!(wait_until(Duration::from_secs(5), || server
            .registry()
            .is_empty()));
        assert!(wait_until(Duration::from_secs(5), || server
            .allocator()
            .used_total()
            == 0));

        server.shutdown().unwrap();
    }

    #[test]
    fn test_hard_limit_refuses_allocation() {
        let guardian = GuardianConfig::new(1024 * 1024, 512 * 1024)
            .with_hard_limit(2 * 1024 * 1024)
            .with_check_interval(Duration::from_secs(60));
        let (handler, frames) = recorder(false);
        let mut server = start(local_config().with_guardian(guardian), handler);

        let mut client = std::net::TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(&(8u32 * 1024 * 1024).to_be_bytes()).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(frames.try_recv().is_err());

        server.shutdown().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tls_round_trip() {
        let cert = TestCert::generate();
        let (handler, frames) = recorder(true);
        let mut server = start(local_config().with_tls(cert.server_config()), handler);
        let addr = server.local_addr().unwrap();

        let options = ConnectOptions::default().with_tls(cert.client_config());
        let mut conn = connect(addr, &options).await.unwrap();
        conn.send(Bytes::from_static(b"encrypted hello")).await.unwrap();

        let reply = conn.next().await.unwrap().unwrap();
        assert_eq!(&reply[..], b"encrypted hello");
        let received = frames.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&received[..], b"encrypted hello");

        let record = server.registry().snapshot();
        assert_eq!(record.len(), 1);
        assert!(record[0].tls);

        server.shutdown().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_plain_client_rejected_by_tls_server() {
        let cert = TestCert::generate();
        let (handler, frames) = recorder(false);
        let mut server = start(local_config().with_tls(cert.server_config()), handler);

        let mut conn = connect(server.local_addr().unwrap(), &ConnectOptions::default())
            .await
            .unwrap();
        let _ = conn.send(Bytes::from_static(b"plaintext")).await;
        let next = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .unwrap();
        assert!(!matches!(next, Some(Ok(_))));
        assert!(frames.try_recv().is_err());

        server.shutdown().unwrap();
    }

    #[test]
    fn test_bad_tls_material_fails_start() {
        let config = local_config().with_tls(crate::tls::TlsConfig::new(
            "/nonexistent/server.crt",
            "/nonexistent/server.key",
        ));
        let allocator = PooledAllocator::new(config.allocator.clone());
        let (handler, _frames) = recorder(false);
        let mut server = QueryServer::new(config, allocator, handler).unwrap();

        assert!(matches!(server.start(), Err(TransportError::Tls(_))));
        assert!(!server.is_running());
    }
}
