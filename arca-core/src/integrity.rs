/*!
Keyed integrity tags over archive members.

Every data chunk (and the header record) travels with a companion `.hmac`
member holding its MAC, rendered in the text form the openssl `dgst` command
prints when reading standard input, so tag files remain interchangeable with
ones produced by the reference CLI:

```text
(stdin)= 9a0b...<hex>
```

The MAC key is the raw passphrase bytes.
*/

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use thiserror::Error;

/// Error describing things that can go wrong with tag handling
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("unknown MAC algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid tag file content")]
    MalformedTag,
}

type Result<T> = std::result::Result<T, IntegrityError>;

type HmacSha512 = Hmac<Sha512>;
type HmacSha256 = Hmac<Sha256>;

/// Tag for the MAC algorithm protecting an archive.
///
/// Names are compared case-sensitively against the allow-list the engine
/// carries; the wire names match the digest names the reference CLI accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MacAlgorithm {
    Sha512,
    Sha256,
}

impl MacAlgorithm {
    pub const DEFAULT: MacAlgorithm = MacAlgorithm::Sha512;

    /// All algorithms this build supports, default first.
    ///
    /// This is the trial order used when verifying a header whose own record
    /// names the algorithm.
    pub fn supported() -> Vec<MacAlgorithm> {
        vec![MacAlgorithm::Sha512, MacAlgorithm::Sha256]
    }

    /// Looks a name up, case-sensitively. Unknown names fail loudly.
    pub fn from_name(name: &str) -> Result<MacAlgorithm> {
        match name {
            "SHA512" => Ok(MacAlgorithm::Sha512),
            "SHA256" => Ok(MacAlgorithm::Sha256),
            other => Err(IntegrityError::UnknownAlgorithm(other.to_owned())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MacAlgorithm::Sha512 => "SHA512",
            MacAlgorithm::Sha256 => "SHA256",
        }
    }

    /// Starts an incremental MAC computation with the given key
    pub fn hasher(self, key: &[u8]) -> MacStream {
        match self {
            MacAlgorithm::Sha512 => MacStream::Sha512(
                HmacSha512::new_from_slice(key).expect("HMAC accepts keys of any size"),
            ),
            MacAlgorithm::Sha256 => MacStream::Sha256(
                HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any size"),
            ),
        }
    }

    /// One-shot MAC of a byte string
    pub fn mac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = self.hasher(key);
        mac.update(data);
        mac.finish()
    }

    /// Recomputes the MAC of `data` and compares it against `tag` in
    /// constant time
    pub fn verify(self, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.hasher(key);
        mac.update(data);
        mac.verify(tag)
    }
}

/// An in-progress MAC computation, fed alongside the chunk writer so the tag
/// is ready the moment the chunk is
pub enum MacStream {
    Sha512(HmacSha512),
    Sha256(HmacSha256),
}

impl MacStream {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            MacStream::Sha512(mac) => mac.update(data),
            MacStream::Sha256(mac) => mac.update(data),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            MacStream::Sha512(mac) => mac.finalize().into_bytes().to_vec(),
            MacStream::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }

    /// Constant-time comparison against an expected tag
    pub fn verify(self, tag: &[u8]) -> bool {
        match self {
            MacStream::Sha512(mac) => mac.verify_slice(tag).is_ok(),
            MacStream::Sha256(mac) => mac.verify_slice(tag).is_ok(),
        }
    }
}

/// Renders a tag the way `dgst` prints one computed over standard input
pub fn render_tag(tag: &[u8]) -> String {
    format!("(stdin)= {}\n", hex::encode(tag))
}

/// Parses a tag file.
///
/// The content is untrusted; accepted shapes are the bare hex digest or the
/// `name= <hex>` line the reference CLI prints. Anything else is rejected.
pub fn parse_tag(untrusted_text: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(untrusted_text).map_err(|_| IntegrityError::MalformedTag)?;
    let text = text.trim();
    let hex_part = match text.rsplit_once('=') {
        Some((_, rest)) => rest.trim(),
        None => text,
    };
    if hex_part.is_empty() || hex_part.len() > 1024 {
        return Err(IntegrityError::MalformedTag);
    }
    hex::decode(hex_part).map_err(|_| IntegrityError::MalformedTag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        let algo = MacAlgorithm::Sha512;
        let tag = algo.mac(b"passphrase", b"some chunk bytes");
        let rendered = render_tag(&tag);
        assert!(rendered.starts_with("(stdin)= "));
        let parsed = parse_tag(rendered.as_bytes()).unwrap();
        assert_eq!(tag, parsed);
        assert!(algo.verify(b"passphrase", b"some chunk bytes", &parsed));
    }

    #[test]
    fn incremental_matches_oneshot() {
        let algo = MacAlgorithm::Sha256;
        let mut mac = algo.hasher(b"pw");
        mac.update(b"hello ");
        mac.update(b"world");
        assert_eq!(mac.finish(), algo.mac(b"pw", b"hello world"));
    }

    #[test]
    fn wrong_key_fails() {
        let algo = MacAlgorithm::Sha512;
        let tag = algo.mac(b"pw", b"data");
        assert!(!algo.verify(b"pW", b"data", &tag));
    }

    #[test]
    fn known_sha256_vector() {
        // RFC 4231 test case 2
        let tag = MacAlgorithm::Sha256.mac(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn unknown_name_fails_loudly() {
        assert!(matches!(
            MacAlgorithm::from_name("sha512"),
            Err(IntegrityError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn hostile_tag_rejected() {
        assert!(parse_tag(b"").is_err());
        assert!(parse_tag(b"(stdin)= zz").is_err());
        assert!(parse_tag(&[0xff, 0xfe]).is_err());
    }
}
