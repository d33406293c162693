//! Lifecycle of the per-process TLS identity.

use std::fmt;

use rcgen::KeyPair;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::descriptor::IdentityDescriptor;
use super::generator::{
    CredentialFiles, GeneratedIdentity, IdentityError, IdentityResult, generate_key_pair,
    issue_certificate, materialize,
};
use crate::trust::{TrustEntry, TrustStoreBackend};

/// Label the certificate is registered under in the platform trust store.
pub const TRUST_LABEL: &str = "localhost";

/// States an [`EphemeralIdentity`] moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    KeyGenerated,
    CertificateIssued,
    Materialized,
    Registered,
    Serving,
    Unregistering,
    Retired,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::KeyGenerated => "KEY_GENERATED",
            Self::CertificateIssued => "CERTIFICATE_ISSUED",
            Self::Materialized => "MATERIALIZED",
            Self::Registered => "REGISTERED",
            Self::Serving => "SERVING",
            Self::Unregistering => "UNREGISTERING",
            Self::Retired => "RETIRED",
        };
        f.write_str(name)
    }
}

/// A trust-store entry this identity created and must remove.
struct Registration {
    backend: Box<dyn TrustStoreBackend>,
    entry: TrustEntry,
}

/// Owns one certificate/key pair and its optional trust-store registration.
///
/// Every successful [`register`](Self::register) is paired with exactly one
/// unregister attempt in [`retire`](Self::retire). Dropping an identity that
/// has not been retired retires it, so early returns and panics still clean up
/// the trust store.
pub struct EphemeralIdentity {
    descriptor: IdentityDescriptor,
    state: LifecycleState,
    history: Vec<LifecycleState>,
    key_pair: Option<KeyPair>,
    certificate: Option<GeneratedIdentity>,
    files: Option<CredentialFiles>,
    registration: Option<Registration>,
}

impl EphemeralIdentity {
    pub fn new(descriptor: IdentityDescriptor) -> Self {
        Self {
            descriptor,
            state: LifecycleState::Uninitialized,
            history: vec![LifecycleState::Uninitialized],
            key_pair: None,
            certificate: None,
            files: None,
            registration: None,
        }
    }

    /// Runs every startup step: key, certificate, temp files and, when a
    /// backend is given, trust-store registration under [`TRUST_LABEL`].
    pub fn prepare(
        descriptor: IdentityDescriptor,
        trust_store: Option<Box<dyn TrustStoreBackend>>,
    ) -> IdentityResult<Self> {
        let mut identity = Self::new(descriptor);
        identity.generate_key()?;
        identity.issue_certificate()?;
        identity.materialize()?;
        if let Some(backend) = trust_store {
            identity.register(backend, TRUST_LABEL)?;
        }
        Ok(identity)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered so far, starting with `UNINITIALIZED`.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn descriptor(&self) -> &IdentityDescriptor {
        &self.descriptor
    }

    pub fn certificate(&self) -> Option<&GeneratedIdentity> {
        self.certificate.as_ref()
    }

    pub fn files(&self) -> Option<&CredentialFiles> {
        self.files.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn generate_key(&mut self) -> IdentityResult<()> {
        self.expect(&[LifecycleState::Uninitialized], LifecycleState::KeyGenerated)?;
        self.key_pair = Some(generate_key_pair()?);
        self.transition(LifecycleState::KeyGenerated);
        Ok(())
    }

    pub fn issue_certificate(&mut self) -> IdentityResult<()> {
        self.expect(&[LifecycleState::KeyGenerated], LifecycleState::CertificateIssued)?;
        let Some(key_pair) = self.key_pair.as_ref() else {
            return Err(self.invalid(LifecycleState::CertificateIssued));
        };
        let certificate = issue_certificate(&self.descriptor, key_pair, OffsetDateTime::now_utc())?;
        self.certificate = Some(certificate);
        self.transition(LifecycleState::CertificateIssued);
        Ok(())
    }

    pub fn materialize(&mut self) -> IdentityResult<&CredentialFiles> {
        self.expect(&[LifecycleState::CertificateIssued], LifecycleState::Materialized)?;
        let Some(certificate) = self.certificate.as_ref() else {
            return Err(self.invalid(LifecycleState::Materialized));
        };
        let files = materialize(certificate.key_pem(), certificate.cert_pem())?;
        self.transition(LifecycleState::Materialized);
        Ok(self.files.insert(files))
    }

    /// Installs the certificate into the trust store.
    ///
    /// On failure the identity stays `MATERIALIZED` and nothing needs undoing.
    pub fn register(
        &mut self,
        backend: Box<dyn TrustStoreBackend>,
        label: &str,
    ) -> IdentityResult<()> {
        self.expect(&[LifecycleState::Materialized], LifecycleState::Registered)?;
        let (Some(files), Some(certificate)) = (self.files.as_ref(), self.certificate.as_ref())
        else {
            return Err(self.invalid(LifecycleState::Registered));
        };
        let entry = TrustEntry::new(label, certificate.serial(), certificate.cert_der());

        info!(
            "registering certificate as '{}' with the {} trust store",
            label,
            backend.name()
        );
        backend
            .register(files.cert_path(), &entry)
            .map_err(IdentityError::Registration)?;

        self.registration = Some(Registration { backend, entry });
        self.transition(LifecycleState::Registered);
        Ok(())
    }

    pub fn begin_serving(&mut self) -> IdentityResult<()> {
        self.expect(
            &[LifecycleState::Materialized, LifecycleState::Registered],
            LifecycleState::Serving,
        )?;
        self.transition(LifecycleState::Serving);
        Ok(())
    }

    /// Removes the trust-store entry (if any) and the temp files.
    ///
    /// Idempotent. Unregister failures are logged and never block shutdown.
    pub fn retire(&mut self) {
        if self.state == LifecycleState::Retired {
            return;
        }

        if let Some(registration) = self.registration.take() {
            self.transition(LifecycleState::Unregistering);
            let Registration { backend, entry } = registration;
            match backend.unregister(&entry) {
                Ok(()) => info!(
                    "removed certificate '{}' (serial {}) from the {} trust store",
                    entry.label,
                    entry.serial,
                    backend.name()
                ),
                Err(e) => warn!(
                    "failed to remove certificate '{}' from trust store: {}",
                    entry.label, e
                ),
            }
        }

        if let Some(files) = self.files.take()
            && let Err(e) = files.remove()
        {
            warn!("failed to remove credential files: {}", e);
        }
        self.key_pair = None;

        self.transition(LifecycleState::Retired);
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!("identity {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn expect(&self, allowed: &[LifecycleState], next: LifecycleState) -> IdentityResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(next))
        }
    }

    fn invalid(&self, next: LifecycleState) -> IdentityError {
        IdentityError::InvalidTransition {
            from: self.state,
            to: next,
        }
    }
}

impl Drop for EphemeralIdentity {
    fn drop(&mut self) {
        self.retire();
    }
}

impl fmt::Debug for EphemeralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralIdentity")
            .field("state", &self.state)
            .field("common_name", &self.descriptor.common_name)
            .field("registered", &self.is_registered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::testing::RecordingBackend;

    fn descriptor() -> IdentityDescriptor {
        IdentityDescriptor {
            country: "US".into(),
            state: "Unknown State".into(),
            locality: "Unknown Locality".into(),
            organization: "Acme".into(),
            common_name: "test.local".into(),
        }
    }

    /// Without registration the machine goes straight from MATERIALIZED to SERVING.
    #[test]
    fn unregistered_run_skips_trust_states() {
        let mut identity = EphemeralIdentity::prepare(descriptor(), None).unwrap();
        identity.begin_serving().unwrap();
        identity.retire();

        assert_eq!(
            identity.history(),
            &[
                LifecycleState::Uninitialized,
                LifecycleState::KeyGenerated,
                LifecycleState::CertificateIssued,
                LifecycleState::Materialized,
                LifecycleState::Serving,
                LifecycleState::Retired,
            ]
        );
    }

    /// A registered identity unregisters exactly once, however often it is retired.
    #[test]
    fn retire_is_idempotent() {
        let backend = RecordingBackend::succeeding();
        let mut identity =
            EphemeralIdentity::prepare(descriptor(), Some(Box::new(backend.clone()))).unwrap();
        identity.begin_serving().unwrap();

        identity.retire();
        identity.retire();
        drop(identity);

        assert_eq!(backend.registered(), 1);
        assert_eq!(backend.unregistered(), 1);
        assert_eq!(backend.entries().len(), 1);
        assert_eq!(backend.entries()[0].label, TRUST_LABEL);
    }

    /// The removal targets the certificate that was installed, not a name.
    #[test]
    fn unregister_targets_installed_certificate() {
        let backend = RecordingBackend::succeeding();
        let descriptor = IdentityDescriptor {
            common_name: "test.local".into(),
            ..descriptor()
        };
        let mut identity =
            EphemeralIdentity::prepare(descriptor, Some(Box::new(backend.clone()))).unwrap();
        let certificate = identity.certificate().unwrap();
        let expected = TrustEntry::new(TRUST_LABEL, certificate.serial(), certificate.cert_der());
        identity.retire();

        assert_eq!(backend.entries(), vec![expected.clone()]);
        assert_eq!(backend.removed(), vec![expected]);
    }

    /// SERVING -> UNREGISTERING -> RETIRED for a registered identity.
    #[test]
    fn registered_run_passes_through_unregistering() {
        let backend = RecordingBackend::succeeding();
        let mut identity =
            EphemeralIdentity::prepare(descriptor(), Some(Box::new(backend.clone()))).unwrap();
        assert_eq!(identity.state(), LifecycleState::Registered);
        identity.begin_serving().unwrap();
        identity.retire();

        assert_eq!(
            &identity.history()[identity.history().len() - 3..],
            &[
                LifecycleState::Serving,
                LifecycleState::Unregistering,
                LifecycleState::Retired,
            ]
        );
    }

    /// Dropping without retiring still pairs the registration.
    #[test]
    fn drop_unregisters() {
        let backend = RecordingBackend::succeeding();
        {
            let mut identity =
                EphemeralIdentity::prepare(descriptor(), Some(Box::new(backend.clone())))
                    .unwrap();
            identity.begin_serving().unwrap();
        }
        assert_eq!(backend.registered(), backend.unregistered());
        assert_eq!(backend.unregistered(), 1);
    }

    /// A failed registration aborts preparation and never triggers an unregister.
    #[test]
    fn failed_registration_aborts() {
        let backend = RecordingBackend::failing_register();
        let result = EphemeralIdentity::prepare(descriptor(), Some(Box::new(backend.clone())));

        assert!(matches!(result, Err(IdentityError::Registration(_))));
        assert_eq!(backend.register_attempts(), 1);
        assert_eq!(backend.registered(), 0);
        assert_eq!(backend.unregistered(), 0);
    }

    /// An unregister failure is swallowed and the identity still retires.
    #[test]
    fn unregister_failure_is_swallowed() {
        let backend = RecordingBackend::failing_unregister();
        let mut identity =
            EphemeralIdentity::prepare(descriptor(), Some(Box::new(backend.clone()))).unwrap();
        identity.begin_serving().unwrap();
        identity.retire();

        assert_eq!(identity.state(), LifecycleState::Retired);
        assert_eq!(backend.unregistered(), 1);
    }

    /// Retiring removes the temp credential files.
    #[test]
    fn retire_removes_credential_files() {
        let mut identity = EphemeralIdentity::prepare(descriptor(), None).unwrap();
        let files = identity.files().unwrap();
        let cert = files.cert_path().to_path_buf();
        let key = files.key_path().to_path_buf();
        assert!(cert.exists() && key.exists());

        identity.retire();
        assert!(!cert.exists());
        assert!(!key.exists());
    }

    /// Steps cannot be taken out of order.
    #[test]
    fn out_of_order_transition_rejected() {
        let mut identity = EphemeralIdentity::new(descriptor());
        assert!(matches!(
            identity.begin_serving(),
            Err(IdentityError::InvalidTransition {
                from: LifecycleState::Uninitialized,
                to: LifecycleState::Serving,
            })
        ));
        assert!(identity.materialize().is_err());
    }
}
