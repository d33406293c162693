//! Local static-file server for WASM builds.
//!
//! In tls mode the server runs on an [`EphemeralIdentity`]: the identity is
//! prepared (and optionally registered) before the socket is bound, moves to
//! `SERVING` once the listener is up, and is retired before the listener is
//! closed, whether the loop ended on a signal or on an error.

mod files;
mod listener;
mod shutdown;
mod tls;

pub use files::{PathError, StaticFiles, resolve_path};
pub use listener::{Accept, ConnectionError, Server};
pub use shutdown::{ShutdownReason, ShutdownSignals};
pub use tls::{TlsAcceptor, TlsError};

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::{ConfigError, ServeMode, ServerConfig};
use crate::identity::{EphemeralIdentity, IdentityDescriptor, IdentityError, LifecycleState};
use crate::trust::TrustStoreBackend;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("registration requested but no trust-store backend is available")]
    MissingTrustStore,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Runtime(#[source] io::Error),
}

impl ServeError {
    /// Whether the failure is a missing cryptographic capability rather than a
    /// problem with this particular run.
    pub fn is_fatal_environment(&self) -> bool {
        match self {
            Self::Identity(e) => e.is_fatal_environment(),
            Self::Tls(e) => e.is_fatal_environment(),
            _ => false,
        }
    }
}

/// Handed to the shutdown callback once the server is accepting connections.
#[derive(Debug, Clone)]
pub struct ServingInfo {
    pub local_addr: SocketAddr,
    pub mode: ServeMode,
    /// PEM certificate clients must trust, in tls mode.
    pub certificate_pem: Option<String>,
    /// Host name to use in URLs.
    pub host: String,
}

impl ServingInfo {
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}/",
            self.mode.scheme(),
            self.host,
            self.local_addr.port()
        )
    }
}

/// Outcome of a run that ended on a shutdown signal.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: ShutdownReason,
    /// States the TLS identity went through. Empty in plain mode.
    pub identity_history: Vec<LifecycleState>,
}

/// Serves `config.root` until `shutdown` resolves or the listener fails.
///
/// `trust_store` is only used when `config.register` is set. Startup
/// failures return before anything is served; a failed registration never
/// leaves the server running with an assumed trust state.
pub async fn run<F, Fut>(
    config: &ServerConfig,
    descriptor: IdentityDescriptor,
    trust_store: Option<Box<dyn TrustStoreBackend>>,
    shutdown: F,
) -> Result<RunSummary, ServeError>
where
    F: FnOnce(ServingInfo) -> Fut,
    Fut: Future<Output = ShutdownReason>,
{
    run_on(
        config,
        descriptor,
        trust_store,
        |addr| TcpListener::bind(addr),
        shutdown,
    )
    .await
}

async fn run_on<L, B, BFut, F, Fut>(
    config: &ServerConfig,
    descriptor: IdentityDescriptor,
    trust_store: Option<Box<dyn TrustStoreBackend>>,
    bind: B,
    shutdown: F,
) -> Result<RunSummary, ServeError>
where
    L: Accept,
    B: FnOnce(SocketAddr) -> BFut,
    BFut: Future<Output = io::Result<L>>,
    F: FnOnce(ServingInfo) -> Fut,
    Fut: Future<Output = ShutdownReason>,
{
    config.validate()?;

    let mut identity = match config.mode {
        ServeMode::Plain => None,
        ServeMode::Tls => {
            let trust_store = match (config.register, trust_store) {
                (false, _) => None,
                (true, Some(backend)) => Some(backend),
                (true, None) => return Err(ServeError::MissingTrustStore),
            };
            Some(blocking(move || EphemeralIdentity::prepare(descriptor, trust_store)).await??)
        }
    };

    let (server, local_addr) = match start(config, identity.as_mut(), bind).await {
        Ok(started) => started,
        Err(e) => {
            retire(identity).await?;
            return Err(e);
        }
    };

    let info = ServingInfo {
        local_addr,
        mode: config.mode,
        certificate_pem: identity
            .as_ref()
            .and_then(|identity| identity.certificate())
            .map(|certificate| certificate.cert_pem().to_string()),
        host: display_host(local_addr, identity.as_ref()),
    };
    info!(
        "Serving {} on {} port {} ({}) ...",
        config.mode.scheme().to_uppercase(),
        local_addr.ip(),
        local_addr.port(),
        info.url()
    );

    let serving = server.run();
    tokio::pin!(serving);

    let outcome = tokio::select! {
        result = &mut serving => Err(match result {
            Err(e) => e,
            Ok(()) => io::Error::other("listener stopped"),
        }),
        reason = shutdown(info) => Ok(reason),
    };

    match &outcome {
        Ok(reason) => info!("{} received, shutting down", reason),
        Err(e) => error!("server error: {}", e),
    }

    // The listener is still open here; it closes when `server` drops.
    let identity_history = retire(identity).await?;

    let reason = outcome.map_err(ServeError::Runtime)?;
    Ok(RunSummary {
        reason,
        identity_history,
    })
}

/// Loads TLS, binds the listener and moves the identity to `SERVING`.
async fn start<L, B, BFut>(
    config: &ServerConfig,
    identity: Option<&mut EphemeralIdentity>,
    bind: B,
) -> Result<(Server<L>, SocketAddr), ServeError>
where
    L: Accept,
    B: FnOnce(SocketAddr) -> BFut,
    BFut: Future<Output = io::Result<L>>,
{
    let tls_acceptor = match identity.as_ref().and_then(|identity| identity.files()) {
        Some(files) => Some(TlsAcceptor::from_pem_files(
            files.cert_path(),
            files.key_path(),
        )?),
        None => None,
    };

    let addr = config.socket_addr();
    let listener = bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    let local_addr = listener.local_addr().map_err(ServeError::Runtime)?;
    debug!("listening on {}", local_addr);

    if let Some(identity) = identity {
        identity.begin_serving()?;
    }

    let files = StaticFiles::new(&config.root, config.cross_origin_isolation);
    Ok((Server::new(listener, tls_acceptor, files), local_addr))
}

/// Retires the identity off the async workers; unregistering may block on
/// `sudo` or a trust-store tool.
async fn retire(identity: Option<EphemeralIdentity>) -> Result<Vec<LifecycleState>, ServeError> {
    match identity {
        Some(mut identity) => {
            blocking(move || {
                identity.retire();
                identity.history().to_vec()
            })
            .await
        }
        None => Ok(Vec::new()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ServeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(ServeError::Runtime(io::Error::other(e))),
    }
}

/// The certificate's common name in tls mode, otherwise the bound address.
fn display_host(local_addr: SocketAddr, identity: Option<&EphemeralIdentity>) -> String {
    if let Some(identity) = identity {
        return identity.descriptor().common_name.clone();
    }
    if local_addr.ip().is_unspecified() {
        "localhost".to_string()
    } else {
        local_addr.ip().to_string()
    }
}
