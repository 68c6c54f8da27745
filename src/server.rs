//! One TCP listener bound to one `listen_interface`: accepts connections,
//! assigns client ids, loads the current `ServerConfig`/TLS config/Logger/
//! Backend atomically, and drives each connection through `SmtpEngine`.
//!
//! Generalizes `MailLaser`'s single hard-wired listener loop in `main.rs`
//! into a reusable `Server` the `Daemon` can start, stop, and reconfigure
//! independently of every other listener — the atomic-holder design comes
//! from `wudi-mail-server`'s `ArcSwap`-backed hot config, and the
//! accept/pool/shutdown shape comes from `remails-com-remails`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::{AllowedHosts, ServerConfig};
use crate::logging::Logger;
use crate::pool::ClientPool;
use crate::protocol::{EngineExit, SmtpEngine};
use crate::session::ClientSession;

/// Either a plain TCP connection or one upgraded to TLS — the concrete
/// transport `SmtpEngine` is generic over in production. `STARTTLS`
/// reclaims the `TcpStream` out of `Conn::Plain` and wraps the handshake
/// result back in as `Conn::Tls`.
pub enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    New,
    Running,
    Stopped,
}

/// One listener's atomic, hot-swappable runtime state plus its client pool.
pub struct Server {
    listen_interface: String,
    config: ArcSwap<ServerConfig>,
    tls_config: ArcSwapOption<rustls::ServerConfig>,
    logger: ArcSwap<Logger>,
    backend: ArcSwap<dyn Backend>,
    allowed_hosts: ArcSwap<AllowedHosts>,
    pool: Arc<ClientPool>,
    next_client_id: AtomicU64,
    active_clients: AtomicUsize,
    shutdown: CancellationToken,
    state: std::sync::Mutex<ServerState>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn Backend>,
        logger: Arc<Logger>,
        allowed_hosts: Arc<AllowedHosts>,
    ) -> Arc<Server> {
        let pool = Arc::new(ClientPool::new(config.max_clients));
        Arc::new(Server {
            listen_interface: config.listen_interface.clone(),
            pool,
            config: ArcSwap::new(Arc::new(config)),
            tls_config: ArcSwapOption::empty(),
            logger: ArcSwap::new(logger),
            backend: ArcSwap::new(backend),
            allowed_hosts: ArcSwap::new(allowed_hosts),
            next_client_id: AtomicU64::new(1),
            active_clients: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            state: std::sync::Mutex::new(ServerState::New),
        })
    }

    pub fn listen_interface(&self) -> &str {
        &self.listen_interface
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    pub fn swap_config(&self, config: ServerConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn swap_tls_config(&self, tls: Arc<rustls::ServerConfig>) {
        self.tls_config.store(Some(tls));
    }

    pub fn swap_logger(&self, logger: Arc<Logger>) {
        self.logger.store(logger);
    }

    pub fn reopen_log(&self) {
        self.logger.load().reopen().ok();
    }

    pub fn swap_backend(&self, backend: Arc<dyn Backend>) {
        self.backend.store(backend);
    }

    pub fn swap_allowed_hosts(&self, hosts: Arc<AllowedHosts>) {
        self.allowed_hosts.store(hosts);
    }

    /// Binds the listener and runs the accept loop until `shutdown` fires.
    /// Returns once every accepted session has finished (or the outer
    /// shutdown deadline elapses).
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ServerState::Running {
                return Ok(());
            }
            *state = ServerState::Running;
        }

        let listener = TcpListener::bind(&self.listen_interface).await?;
        self.logger
            .load()
            .info(format_args!("listening on {}", self.listen_interface));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            self.logger.load().error(format_args!("accept error: {e}"));
                            continue;
                        }
                    };
                    self.spawn_session(socket, remote);
                }
            }
        }

        self.pool.drain(self.config.load().max_clients).await;
        *self.state.lock().unwrap() = ServerState::Stopped;
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    fn spawn_session(self: &Arc<Self>, socket: TcpStream, remote: SocketAddr) {
        let server = self.clone();
        tokio::spawn(async move {
            let Ok(slot) = server.pool.acquire().await else {
                return;
            };
            server
                .active_clients
                .fetch_add(1, Ordering::Relaxed);
            let client_id = server.next_client_id.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = server.run_session(socket, remote, client_id).await {
                server
                    .logger
                    .load()
                    .error(format_args!("client#{client_id} session error: {e}"));
            }
            server
                .active_clients
                .fetch_sub(1, Ordering::Relaxed);
            drop(slot);
        });
    }

    async fn run_session(
        self: &Arc<Self>,
        socket: TcpStream,
        remote: SocketAddr,
        client_id: u64,
    ) -> anyhow::Result<()> {
        let config = self.config.load_full();
        let backend = self.backend.load_full();
        let logger = self.logger.load_full();
        let allowed_hosts = self.allowed_hosts.load_full();

        let mut conn = if config.tls_always_on {
            match self.tls_config.load_full() {
                Some(tls) => match tokio_rustls::TlsAcceptor::from(tls).accept(socket).await {
                    Ok(stream) => Conn::Tls(Box::new(stream)),
                    Err(e) => {
                        logger.error(format_args!("client#{client_id} TLS handshake failed: {e}"));
                        return Ok(());
                    }
                },
                None => {
                    logger.error(format_args!(
                        "client#{client_id}: tls_always_on set but no TLS config loaded"
                    ));
                    return Ok(());
                }
            }
        } else {
            Conn::Plain(socket)
        };

        let tls_already = matches!(conn, Conn::Tls(_));
        let mut session = ClientSession::new(client_id, remote.ip().to_string());
        session.tls = tls_already;

        loop {
            let active = self.active_clients.load(Ordering::Relaxed);
            let mut engine = SmtpEngine::new(
                conn,
                session,
                (*config).clone(),
                allowed_hosts.clone(),
                backend.clone(),
                logger.clone(),
                self.shutdown.clone(),
                active,
            );
            let exit = engine.run().await?;
            match exit {
                EngineExit::Closed => return Ok(()),
                EngineExit::StartTlsRequested => {
                    let raw = engine.into_io();
                    let plain = match raw {
                        Conn::Plain(stream) => stream,
                        Conn::Tls(_) => unreachable!("STARTTLS requested on an already-TLS session"),
                    };
                    let Some(tls) = self.tls_config.load_full() else {
                        return Ok(());
                    };
                    match tokio_rustls::TlsAcceptor::from(tls).accept(plain).await {
                        Ok(stream) => {
                            conn = Conn::Tls(Box::new(stream));
                            // A successful STARTTLS clears Helo and any envelope and
                            // stops advertising STARTTLS again (session.tls = true).
                            session = ClientSession::new(client_id, remote.ip().to_string());
                            session.tls = true;
                        }
                        Err(e) => {
                            logger.error(format_args!(
                                "client#{client_id} STARTTLS handshake failed: {e}"
                            ));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// How long `Daemon::shutdown` waits for all servers' pools to drain
/// before force-closing residual connections.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(60);
