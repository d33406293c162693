//! Local development server for WASM builds.
//!
//! This crate serves a build tree over plain HTTP or HTTPS with the
//! cross-origin isolation headers that threaded WASM needs, and packs build
//! outputs into a distribution directory.
//!
//! # Ephemeral TLS identity
//!
//! In tls mode the server:
//! 1. Generates a fresh key pair and a self-signed certificate valid for 24
//!    hours, with a DNS SAN equal to the common name
//! 2. Writes both to temporary files and loads them into rustls
//! 3. Optionally registers the certificate in the host trust store
//!    (`certutil`, `security` or `update-ca-certificates`)
//! 4. Serves until SIGINT/SIGTERM or a listener error
//! 5. Unregisters the certificate exactly once and deletes the files
//!
//! # Example
//!
//! ```no_run
//! use devserve::{IdentityDescriptor, ServerConfig, ShutdownSignals, server};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::parse("mode: tls\nport: 8443\n")?;
//! let mut signals = ShutdownSignals::install()?;
//! let summary = server::run(&config, IdentityDescriptor::from_env(), None, |info| async move {
//!     println!("open {}", info.url());
//!     signals.recv().await
//! })
//! .await?;
//! println!("stopped on {}", summary.reason);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod identity;
pub mod pack;
pub mod server;
pub mod trust;

pub use config::{ConfigError, ServeMode, ServerConfig};
pub use identity::{EphemeralIdentity, IdentityDescriptor, IdentityError, LifecycleState};
pub use pack::{PackError, PackReport, pack_artifacts};
pub use server::{RunSummary, ServeError, ServingInfo, ShutdownReason, ShutdownSignals};
pub use trust::{TrustError, TrustStoreBackend, detect_backend};
