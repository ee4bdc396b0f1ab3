/*!
This crate contains the data structures and byte-level primitives shared by
every consumer of the arca backup archive format: the ASCII header record and
its integrity tag, the openssl-compatible cipher and digest streams, the
compression filters, the fixed-size chunk splitter, the member name grammar,
and the catalog snapshot model.

Everything in this crate that parses bytes assumes those bytes are attacker
controlled until stated otherwise. The header must fully validate before any
other byte of an archive is trusted, and member names must pass the grammar
in [`names`] before they are used to touch the filesystem.
*/

#![warn(clippy::all)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod catalog;
pub mod cipher;
pub mod filter;
pub mod header;
pub mod integrity;
pub mod names;
pub mod split;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// The passphrase protecting an archive's integrity and, optionally, its
/// confidentiality.
///
/// The MAC key is the raw UTF-8 bytes of the passphrase, and the cipher key
/// is derived from the same bytes, so the two uses share one secret. Zeroed
/// on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Passphrase {
        Passphrase(secret.into())
    }

    /// The raw bytes used as MAC key and cipher key material
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

impl From<String> for Passphrase {
    fn from(secret: String) -> Passphrase {
        Passphrase(secret)
    }
}

impl From<&str> for Passphrase {
    fn from(secret: &str) -> Passphrase {
        Passphrase(secret.to_owned())
    }
}
