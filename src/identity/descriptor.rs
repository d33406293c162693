//! Subject attributes for the ephemeral certificate.

use std::env;

pub const DEFAULT_COUNTRY: &str = "US";
pub const DEFAULT_STATE: &str = "Unknown State";
pub const DEFAULT_LOCALITY: &str = "Unknown Locality";
pub const DEFAULT_COMMON_NAME: &str = "localhost";

/// Distinguished-name fields used for both subject and issuer.
///
/// All fields are free-form. Empty strings are kept as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDescriptor {
    pub country: String,
    pub state: String,
    pub locality: String,
    pub organization: String,
    /// Host name the certificate is valid for. Also used as the SAN DNS entry.
    pub common_name: String,
}

impl IdentityDescriptor {
    /// Reads the descriptor from `COUNTRY`, `STATE`, `CITY`, `ORGANIZATION`
    /// and `COMMON_NAME`, falling back to defaults for unset variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the descriptor from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        Self {
            country: get("COUNTRY", DEFAULT_COUNTRY),
            state: get("STATE", DEFAULT_STATE),
            locality: get("CITY", DEFAULT_LOCALITY),
            organization: lookup("ORGANIZATION").unwrap_or_else(local_host_name),
            common_name: get("COMMON_NAME", DEFAULT_COMMON_NAME),
        }
    }
}

impl Default for IdentityDescriptor {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Host name of the local machine, or an empty string if it cannot be read.
fn local_host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
