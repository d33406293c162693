//! Self-signed certificate generation using rcgen.

use std::io::{self, Write};
use std::path::Path;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, SanType,
    SerialNumber,
};
use rustls::pki_types::CertificateDer;
use tempfile::{Builder as TempFileBuilder, TempPath};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::descriptor::IdentityDescriptor;
use super::lifecycle::LifecycleState;
use crate::trust::TrustError;

/// Lifetime of every generated certificate.
pub const CERTIFICATE_VALIDITY: Duration = Duration::hours(24);

/// The result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("common name {0:?} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("failed to write credential file: {0}")]
    Materialize(#[source] io::Error),
    #[error("failed to register certificate in trust store: {0}")]
    Registration(#[source] TrustError),
    #[error("invalid identity transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl IdentityError {
    /// Whether this error means the cryptographic backend itself is unusable.
    pub fn is_fatal_environment(&self) -> bool {
        matches!(self, Self::KeyGeneration(_))
    }
}

/// A freshly issued certificate together with its private key.
pub struct GeneratedIdentity {
    key_pem: String,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl GeneratedIdentity {
    /// PKCS#8 private key in PEM format.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Big-endian serial number, exactly as encoded in the certificate.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

impl std::fmt::Debug for GeneratedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedIdentity")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Generates a fresh ECDSA P-256 signing key.
pub fn generate_key_pair() -> IdentityResult<KeyPair> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(IdentityError::KeyGeneration)
}

/// Issues a self-signed certificate for `descriptor`, valid for 24 hours from `issued_at`.
///
/// `issued_at` is truncated to whole seconds, the precision of X.509 validity times.
pub fn issue_certificate(
    descriptor: &IdentityDescriptor,
    key_pair: &KeyPair,
    issued_at: OffsetDateTime,
) -> IdentityResult<GeneratedIdentity> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, descriptor.country.as_str());
    dn.push(DnType::StateOrProvinceName, descriptor.state.as_str());
    dn.push(DnType::LocalityName, descriptor.locality.as_str());
    dn.push(DnType::OrganizationName, descriptor.organization.as_str());
    dn.push(DnType::CommonName, descriptor.common_name.as_str());

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(
        descriptor
            .common_name
            .as_str()
            .try_into()
            .map_err(|_| IdentityError::InvalidDnsName(descriptor.common_name.clone()))?,
    )];
    let serial = random_serial();
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let not_before = issued_at - Duration::nanoseconds(i64::from(issued_at.nanosecond()));
    params.not_before = not_before;
    params.not_after = not_before + CERTIFICATE_VALIDITY;

    let cert = params
        .self_signed(key_pair)
        .map_err(IdentityError::Signing)?;

    debug!(
        "issued self-signed certificate for {} (valid until {})",
        descriptor.common_name, params.not_after
    );

    Ok(GeneratedIdentity {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        cert_der: cert.der().clone(),
        serial: serial.to_vec(),
        not_before,
        not_after: params.not_after,
    })
}

/// Generates a key pair and a certificate for it in one step.
pub fn generate(descriptor: &IdentityDescriptor) -> IdentityResult<GeneratedIdentity> {
    let key_pair = generate_key_pair()?;
    issue_certificate(descriptor, &key_pair, OffsetDateTime::now_utc())
}

/// Random positive 128-bit serial number.
///
/// The leading byte is non-zero so the DER integer keeps all 16 bytes and
/// matches what trust-store tools print.
fn random_serial() -> [u8; 16] {
    let mut bytes: [u8; 16] = rand::random();
    bytes[0] = (bytes[0] & 0x7f).max(1);
    bytes
}

/// Certificate and key written to uniquely named temporary files.
///
/// Both files are removed when this value is dropped or [`remove`](Self::remove)d.
pub struct CredentialFiles {
    cert: TempPath,
    key: TempPath,
}

impl CredentialFiles {
    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    pub fn key_path(&self) -> &Path {
        &self.key
    }

    /// Deletes both files, reporting the first failure.
    pub fn remove(self) -> io::Result<()> {
        let cert = self.cert.close();
        let key = self.key.close();
        cert.and(key)
    }
}

impl std::fmt::Debug for CredentialFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialFiles")
            .field("cert", &self.cert_path())
            .field("key", &self.key_path())
            .finish()
    }
}

/// Writes the PEM blobs to two distinct temp files so the TLS layer can load them by path.
pub fn materialize(key_pem: &str, cert_pem: &str) -> IdentityResult<CredentialFiles> {
    let cert = write_temp(".crt", cert_pem)?;
    let key = write_temp(".key", key_pem)?;

    debug!(
        "credentials written to {} and {}",
        cert.display(),
        key.display()
    );

    Ok(CredentialFiles { cert, key })
}

fn write_temp(suffix: &str, contents: &str) -> IdentityResult<TempPath> {
    let mut file = TempFileBuilder::new()
        .prefix("devserve-")
        .suffix(suffix)
        .tempfile()
        .map_err(IdentityError::Materialize)?;
    file.write_all(contents.as_bytes())
        .map_err(IdentityError::Materialize)?;
    file.flush().map_err(IdentityError::Materialize)?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn acme() -> IdentityDescriptor {
        IdentityDescriptor {
            country: "US".into(),
            state: "Unknown State".into(),
            locality: "Unknown Locality".into(),
            organization: "Acme".into(),
            common_name: "test.local".into(),
        }
    }

    fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
        cert.subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Issuer and subject are the same distinguished name.
    #[test]
    fn certificate_is_self_signed() {
        let identity = generate(&acme()).unwrap();
        let (_, cert) = X509Certificate::from_der(identity.cert_der()).unwrap();

        assert_eq!(cert.issuer().as_raw(), cert.subject().as_raw());
        let org = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok());
        assert_eq!(org, Some("Acme"));
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok());
        assert_eq!(cn, Some("test.local"));
    }

    /// The validity window is exactly 24 hours, even for sub-second timestamps.
    #[test]
    fn validity_is_exactly_one_day() {
        let key_pair = generate_key_pair().unwrap();
        let issued_at = OffsetDateTime::from_unix_timestamp_nanos(1_700_000_000_987_654_321).unwrap();
        let identity = issue_certificate(&acme(), &key_pair, issued_at).unwrap();
        let (_, cert) = X509Certificate::from_der(identity.cert_der()).unwrap();

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert_eq!(not_before, 1_700_000_000);
        assert_eq!(not_after - not_before, 24 * 60 * 60);
        assert_eq!(
            identity.not_after() - identity.not_before(),
            CERTIFICATE_VALIDITY
        );
    }

    /// The SAN extension holds exactly the common name.
    #[test]
    fn san_is_common_name() {
        let identity = generate(&acme()).unwrap();
        let (_, cert) = X509Certificate::from_der(identity.cert_der()).unwrap();
        assert_eq!(dns_names(&cert), vec!["test.local".to_string()]);
    }

    /// Empty distinguished-name components are accepted.
    #[test]
    fn empty_components_are_accepted() {
        let descriptor = IdentityDescriptor {
            state: String::new(),
            locality: String::new(),
            organization: String::new(),
            ..acme()
        };
        assert!(generate(&descriptor).is_ok());
    }

    /// Non-ASCII common names cannot be expressed as a DNS SAN.
    #[test]
    fn non_ascii_common_name_rejected() {
        let descriptor = IdentityDescriptor {
            common_name: "bücher.local".into(),
            ..acme()
        };
        assert!(matches!(
            generate(&descriptor),
            Err(IdentityError::InvalidDnsName(_))
        ));
    }

    /// Parsing the PEM output yields the same key, serial and SAN as the DER certificate.
    #[test]
    fn pem_output_matches_issued_certificate() {
        let identity = generate(&acme()).unwrap();
        let (_, original) = X509Certificate::from_der(identity.cert_der()).unwrap();

        let (_, pem) = parse_x509_pem(identity.cert_pem().as_bytes()).unwrap();
        let parsed = pem.parse_x509().unwrap();
        assert_eq!(parsed.raw_serial(), original.raw_serial());
        assert_eq!(parsed.public_key().raw, original.public_key().raw);
        assert_eq!(dns_names(&parsed), dns_names(&original));

        // The exported key must sign for the same public key.
        let key_pair = KeyPair::from_pem(identity.key_pem()).unwrap();
        let reissued = issue_certificate(&acme(), &key_pair, OffsetDateTime::now_utc()).unwrap();
        let (_, reissued) = X509Certificate::from_der(reissued.cert_der()).unwrap();
        assert_eq!(reissued.public_key().raw, original.public_key().raw);
    }

    /// Each call produces a different key and serial number.
    #[test]
    fn identities_are_not_reused() {
        let first = generate(&acme()).unwrap();
        let second = generate(&acme()).unwrap();
        assert_ne!(first.key_pem(), second.key_pem());

        let (_, a) = X509Certificate::from_der(first.cert_der()).unwrap();
        let (_, b) = X509Certificate::from_der(second.cert_der()).unwrap();
        assert_ne!(a.raw_serial(), b.raw_serial());
    }

    /// The recorded serial is byte-for-byte the one in the certificate.
    #[test]
    fn serial_matches_encoding() {
        for _ in 0..16 {
            let identity = generate(&acme()).unwrap();
            let (_, cert) = X509Certificate::from_der(identity.cert_der()).unwrap();
            assert_eq!(cert.raw_serial(), identity.serial());
            assert_eq!(identity.serial().len(), 16);
        }
    }

    /// Credential files get distinct paths with the expected contents and vanish on removal.
    #[test]
    fn materialize_writes_distinct_files() {
        let identity = generate(&acme()).unwrap();
        let files = materialize(identity.key_pem(), identity.cert_pem()).unwrap();

        assert_ne!(files.cert_path(), files.key_path());
        assert_eq!(
            std::fs::read_to_string(files.cert_path()).unwrap(),
            identity.cert_pem()
        );
        assert!(
            std::fs::read_to_string(files.key_path())
                .unwrap()
                .contains("BEGIN PRIVATE KEY")
        );

        let cert_path = files.cert_path().to_path_buf();
        let key_path = files.key_path().to_path_buf();
        files.remove().unwrap();
        assert!(!cert_path.exists());
        assert!(!key_path.exists());
    }
}
