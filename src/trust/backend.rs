//! Platform trust-store backends.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::command::{CommandRunner, SystemRunner};

/// Keychain the Apple backend trusts certificates in.
pub const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Directory `update-ca-certificates` picks local certificates up from.
pub const LINUX_CA_DIR: &str = "/usr/local/share/ca-certificates";

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("`{program}` not found in PATH")]
    CommandNotFound { program: String },
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed ({})", describe_status(.status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
    },
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no trust-store support for platform {0}")]
    UnsupportedPlatform(String),
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Identifies one installed certificate precisely enough to remove it again.
///
/// Stores match on different keys: Windows finds certificates by serial
/// number, macOS by SHA-256 fingerprint, the Linux CA directory by file name.
/// Deleting by subject name would also remove unrelated certificates that
/// happen to share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    /// File stem used in directory-based stores.
    pub label: String,
    /// Serial number as lowercase hex.
    pub serial: String,
    /// SHA-256 of the DER certificate as uppercase hex.
    pub sha256: String,
}

impl TrustEntry {
    pub fn new(label: impl Into<String>, serial: &[u8], cert_der: &[u8]) -> Self {
        Self {
            label: label.into(),
            serial: hex_encode(serial),
            sha256: hex_encode(&Sha256::digest(cert_der)).to_uppercase(),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// A host trust store that can install and remove one certificate.
pub trait TrustStoreBackend: Send {
    /// Short platform name for log messages.
    fn name(&self) -> &'static str;

    /// Installs the PEM certificate at `cert_path`.
    fn register(&self, cert_path: &Path, entry: &TrustEntry) -> Result<(), TrustError>;

    /// Removes the certificate described by `entry`.
    fn unregister(&self, entry: &TrustEntry) -> Result<(), TrustError>;
}

/// Windows `Root` store via `certutil`.
pub struct WindowsBackend {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl TrustStoreBackend for WindowsBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn register(&self, cert_path: &Path, _entry: &TrustEntry) -> Result<(), TrustError> {
        let cert = cert_path.to_string_lossy();
        self.runner
            .run("certutil", &["-addstore", "Root", cert.as_ref()])
    }

    fn unregister(&self, entry: &TrustEntry) -> Result<(), TrustError> {
        self.runner
            .run("certutil", &["-delstore", "Root", entry.serial.as_str()])
    }
}

/// macOS system keychain via `security`, elevated with `sudo`.
pub struct AppleBackend {
    runner: Arc<dyn CommandRunner>,
}

impl AppleBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl TrustStoreBackend for AppleBackend {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn register(&self, cert_path: &Path, _entry: &TrustEntry) -> Result<(), TrustError> {
        let cert = cert_path.to_string_lossy();
        self.runner.run(
            "sudo",
            &[
                "security",
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                SYSTEM_KEYCHAIN,
                cert.as_ref(),
            ],
        )
    }

    fn unregister(&self, entry: &TrustEntry) -> Result<(), TrustError> {
        self.runner.run(
            "sudo",
            &[
                "security",
                "delete-certificate",
                "-Z",
                entry.sha256.as_str(),
                SYSTEM_KEYCHAIN,
            ],
        )
    }
}

/// Debian-style CA directory refreshed with `update-ca-certificates`.
pub struct LinuxBackend {
    ca_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LinuxBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_ca_dir(LINUX_CA_DIR, runner)
    }

    pub fn with_ca_dir(ca_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            ca_dir: ca_dir.into(),
            runner,
        }
    }

    /// Where the certificate for `label` is installed.
    pub fn installed_path(&self, label: &str) -> PathBuf {
        self.ca_dir.join(format!("{label}.crt"))
    }

    fn install(&self, cert_path: &Path, dest: &Path) -> Result<(), TrustError> {
        match fs::copy(cert_path, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("no write access to {}, retrying with sudo", dest.display());
                let cert = cert_path.to_string_lossy();
                let dest = dest.to_string_lossy();
                self.runner.run(
                    "sudo",
                    &["install", "-m", "0644", cert.as_ref(), dest.as_ref()],
                )
            }
            Err(source) => Err(TrustError::Io {
                path: dest.to_path_buf(),
                source,
            }),
        }
    }

    fn uninstall(&self, dest: &Path) -> Result<(), TrustError> {
        match fs::remove_file(dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                let dest = dest.to_string_lossy();
                self.runner.run("sudo", &["rm", "-f", dest.as_ref()])
            }
            Err(source) => Err(TrustError::Io {
                path: dest.to_path_buf(),
                source,
            }),
        }
    }
}

impl TrustStoreBackend for LinuxBackend {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn register(&self, cert_path: &Path, entry: &TrustEntry) -> Result<(), TrustError> {
        let dest = self.installed_path(&entry.label);
        self.install(cert_path, &dest)?;

        if let Err(e) = self.runner.run("sudo", &["update-ca-certificates"]) {
            // Leave no half-registered file behind.
            if let Err(cleanup) = self.uninstall(&dest) {
                warn!("failed to remove {}: {}", dest.display(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    fn unregister(&self, entry: &TrustEntry) -> Result<(), TrustError> {
        self.uninstall(&self.installed_path(&entry.label))?;
        self.runner.run("sudo", &["update-ca-certificates", "--fresh"])
    }
}

/// Selects the backend for the host platform, running real commands.
pub fn detect_backend() -> Result<Box<dyn TrustStoreBackend>, TrustError> {
    detect_backend_with(Arc::new(SystemRunner))
}

/// Selects the backend for the host platform with a custom command runner.
pub fn detect_backend_with(
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn TrustStoreBackend>, TrustError> {
    if cfg!(target_os = "windows") {
        Ok(Box::new(WindowsBackend::new(runner)))
    } else if cfg!(target_os = "macos") {
        Ok(Box::new(AppleBackend::new(runner)))
    } else if cfg!(target_os = "linux") {
        Ok(Box::new(LinuxBackend::new(runner)))
    } else {
        Err(TrustError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }
}
