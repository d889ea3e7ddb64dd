//! Computes the cache keys for requests.
//!
//! A fingerprint is the SHA-256 digest of the exact wire bytes of a request. Two requests share
//! a cache entry if and only if they are byte-for-byte identical (including their message id).
//!
//! # Example
//! ```
//! # use ldapcache::fingerprint::Fingerprint;
//! let first = Fingerprint::of(b"request");
//! let second = Fingerprint::of(b"request");
//! assert_eq!(first, second);
//! assert_ne!(first, Fingerprint::of(b"other request"));
//! ```
use std::fmt::{Display, Formatter};

use sha2::{Digest, Sha256};

use crate::lru::ByteSize;

/// Represents the digest of a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Computes the fingerprint of the given bytes.
    pub fn of(data: &[u8]) -> Self {
        Fingerprint(Sha256::digest(data).into())
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl ByteSize for Fingerprint {
    fn allocated_size(&self) -> usize {
        self.0.len()
    }
}
