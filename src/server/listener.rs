//! Accept loop for the file server.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::files::StaticFiles;
use super::tls::TlsAcceptor;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Source of incoming TCP connections.
pub trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the pending connection is affected.
    Connection,
    /// The process is short on a resource (file descriptors, memory).
    Resource,
    /// The listening socket itself is unusable.
    Listener,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptFailure::Connection,
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::Unsupported => {
            AcceptFailure::Listener
        }
        _ => AcceptFailure::Resource,
    }
}

/// A bound listener serving static files over HTTP or HTTPS.
pub struct Server<L = TcpListener> {
    listener: L,
    tls_acceptor: Option<TlsAcceptor>,
    files: Arc<StaticFiles>,
}

impl<L: Accept> Server<L> {
    pub fn new(listener: L, tls_acceptor: Option<TlsAcceptor>, files: StaticFiles) -> Self {
        Self {
            listener,
            tls_acceptor,
            files: Arc::new(files),
        }
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener itself fails.
    ///
    /// Errors that only affect one pending connection are skipped; resource
    /// exhaustion backs off before the next attempt.
    pub async fn run(&self) -> Result<(), io::Error> {
        let mut backoff = MIN_ACCEPT_BACKOFF;
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => {
                    backoff = MIN_ACCEPT_BACKOFF;
                    accepted
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptFailure::Connection => {
                        debug!("accept failed: {}", e);
                        continue;
                    }
                    AcceptFailure::Resource => {
                        warn!("accept failed, retrying in {:?}: {}", backoff, e);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                        continue;
                    }
                    AcceptFailure::Listener => return Err(e),
                },
            };
            debug!("accepted connection from {}", peer_addr);

            let files = Arc::clone(&self.files);
            let tls_acceptor = self.tls_acceptor.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, files, tls_acceptor).await {
                    debug!("connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Handles a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    files: Arc<StaticFiles>,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), ConnectionError> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::TlsHandshake)?;
            serve_connection(tls_stream, peer_addr, files).await
        }
        None => serve_connection(stream, peer_addr, files).await,
    }
}

/// Serves HTTP/1.1 or HTTP/2 on an established stream.
async fn serve_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    files: Arc<StaticFiles>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let files = Arc::clone(&files);
        async move {
            let method = req.method().clone();
            let uri = req.uri().clone();
            let version = req.version();
            let response = files.respond(req).await;
            info!(
                "{} \"{} {} {:?}\" {}",
                peer_addr.ip(),
                method,
                uri,
                version,
                response.status().as_u16()
            );
            Ok::<_, Infallible>(response)
        }
    });

    ServerBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(ConnectionError::Http)?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),
}
