//! Ephemeral TLS identity.
//!
//! One self-signed certificate/key pair per process, valid for 24 hours,
//! optionally registered in the host trust store and always unregistered
//! before the process exits.

mod descriptor;
mod generator;
mod lifecycle;

pub use descriptor::IdentityDescriptor;
pub use generator::{
    CERTIFICATE_VALIDITY, CredentialFiles, GeneratedIdentity, IdentityError, IdentityResult,
    generate, generate_key_pair, issue_certificate, materialize,
};
pub use lifecycle::{EphemeralIdentity, LifecycleState, TRUST_LABEL};
