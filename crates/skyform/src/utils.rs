//! Utilities for working with `skyform`.

use crate::HasDependencies;

/// Returns the uppercase hex sha256 digest of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes.as_ref());
    data_encoding::HEXUPPER.encode(digest.as_ref())
}

/// A secret value, such as a private key.
///
/// It serializes transparently, so it is still written to the store, but
/// its `Debug` output (and therefore every log line and plan diff) only
/// shows a fingerprint.
#[derive(Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Sensitive<T>(pub T);

impl<T> Sensitive<T> {
    pub fn new(value: T) -> Self {
        Sensitive(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: AsRef<[u8]>> core::fmt::Debug for Sensitive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fingerprint = sha256_hex(&self.0);
        write!(f, "Sensitive(sha256:{})", &fingerprint[..12])
    }
}

impl<T: HasDependencies> HasDependencies for Sensitive<T> {
    fn dependencies(&self) -> crate::Dependencies {
        self.0.dependencies()
    }
}

impl From<String> for Sensitive<String> {
    fn from(value: String) -> Self {
        Sensitive(value)
    }
}

impl From<&str> for Sensitive<String> {
    fn from(value: &str) -> Self {
        Sensitive(value.to_owned())
    }
}
