/*!
The archive header is a small ASCII record of `key=value` lines leading the
archive, describing the parameters everything after it was produced with. It
travels with a MAC companion and is the first (and, until verified, only)
thing read from an archive.
*/

use std::fmt::Write as _;

use thiserror::Error;

/// Member name of the header record inside an archive
pub const HEADER_FILENAME: &str = "backup-header";

/// Format version written by the producer
pub const CURRENT_FORMAT_VERSION: u32 = 4;

/// Error describing the ways an untrusted header can be rejected
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("non-ASCII bytes in backup header")]
    NotAscii,
    #[error("malformed backup header line: {0:?}")]
    BadSyntax(String),
    #[error("duplicated backup header key: {0}")]
    DuplicateKey(String),
    #[error("unsupported backup format version: {0}")]
    UnsupportedVersion(u64),
    #[error("backup header lacks {0}")]
    MissingField(&'static str),
    #[error("corrupted backup header (integrity verification failed)")]
    Corrupt,
}

type Result<T> = std::result::Result<T, HeaderError>;

/// Parameters of an archive, as carried by its leading header record.
///
/// `version` 1 denotes the legacy headerless format; such a value is never
/// parsed out of a real record, only synthesized by the legacy detection
/// path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupHeader {
    pub version: u32,
    pub encrypted: bool,
    pub compressed: bool,
    pub compression_filter: Option<String>,
    pub crypto_algorithm: Option<String>,
    pub hmac_algorithm: Option<String>,
}

impl BackupHeader {
    /// Header for a legacy version-1 archive, which carries no record of its
    /// own
    pub fn legacy_v1() -> BackupHeader {
        BackupHeader {
            version: 1,
            encrypted: false,
            compressed: false,
            compression_filter: None,
            crypto_algorithm: None,
            hmac_algorithm: None,
        }
    }

    /// Parses and validates an untrusted header record.
    ///
    /// This runs before the record's MAC can even be checked (the MAC
    /// algorithm is itself named by the record), so it is strict: pure
    /// ASCII, `version` on the first line, one `=` per line, keys and values
    /// from `[A-Za-z0-9-]+`, no duplicated keys. Unknown keys are ignored
    /// but still have to satisfy the grammar.
    pub fn load(untrusted_bytes: &[u8]) -> Result<BackupHeader> {
        if !untrusted_bytes.is_ascii() {
            return Err(HeaderError::NotAscii);
        }
        // ASCII just verified
        let text = std::str::from_utf8(untrusted_bytes).map_err(|_| HeaderError::NotAscii)?;

        let mut version: Option<u64> = None;
        let mut encrypted: Option<bool> = None;
        let mut compressed: Option<bool> = None;
        let mut compression_filter: Option<String> = None;
        let mut crypto_algorithm: Option<String> = None;
        let mut hmac_algorithm: Option<String> = None;
        let mut first_line = true;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = match parts.next() {
                Some(v) if !v.contains('=') => v,
                _ => return Err(HeaderError::BadSyntax(line.to_owned())),
            };
            if !is_alphanum_dash(key) || !is_alphanum_dash(value) {
                return Err(HeaderError::BadSyntax(line.to_owned()));
            }
            if first_line && key != "version" {
                return Err(HeaderError::BadSyntax(line.to_owned()));
            }
            first_line = false;
            match key {
                "version" => {
                    if version.is_some() {
                        return Err(HeaderError::DuplicateKey(key.to_owned()));
                    }
                    let v: u64 = value
                        .parse()
                        .map_err(|_| HeaderError::BadSyntax(line.to_owned()))?;
                    version = Some(v);
                }
                "encrypted" => set_bool(&mut encrypted, key, value)?,
                "compressed" => set_bool(&mut compressed, key, value)?,
                "compression-filter" => set_string(&mut compression_filter, key, value)?,
                "crypto-algorithm" => set_string(&mut crypto_algorithm, key, value)?,
                "hmac-algorithm" => set_string(&mut hmac_algorithm, key, value)?,
                // Unknown option, ignored for forward compatibility
                _ => {}
            }
        }

        let version = version.ok_or(HeaderError::MissingField("version"))?;
        let version = match version {
            1..=4 => version as u32,
            other => return Err(HeaderError::UnsupportedVersion(other)),
        };

        let header = BackupHeader {
            version,
            encrypted: encrypted.unwrap_or(false),
            compressed: compressed.unwrap_or(false),
            compression_filter,
            crypto_algorithm,
            hmac_algorithm,
        };
        if version >= 2 && encrypted.is_none() {
            return Err(HeaderError::MissingField("encrypted"));
        }
        if version >= 2 && compressed.is_none() {
            return Err(HeaderError::MissingField("compressed"));
        }
        header.validate()?;
        Ok(header)
    }

    /// Checks the version-dependent required-field rules
    pub fn validate(&self) -> Result<()> {
        match self.version {
            1 => Ok(()),
            2..=4 => {
                if self.hmac_algorithm.is_none() {
                    return Err(HeaderError::MissingField("hmac-algorithm"));
                }
                if self.encrypted && self.crypto_algorithm.is_none() {
                    return Err(HeaderError::MissingField("crypto-algorithm"));
                }
                if self.version >= 3 && self.compressed && self.compression_filter.is_none() {
                    return Err(HeaderError::MissingField("compression-filter"));
                }
                Ok(())
            }
            other => Err(HeaderError::UnsupportedVersion(u64::from(other))),
        }
    }

    /// Serializes the record, `version` first, remaining keys in a fixed
    /// order, `None` fields omitted
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = writeln!(out, "version={}", self.version);
        let _ = writeln!(out, "encrypted={}", self.encrypted);
        let _ = writeln!(out, "compressed={}", self.compressed);
        if let Some(filter) = &self.compression_filter {
            let _ = writeln!(out, "compression-filter={filter}");
        }
        if let Some(algo) = &self.crypto_algorithm {
            let _ = writeln!(out, "crypto-algorithm={algo}");
        }
        if let Some(algo) = &self.hmac_algorithm {
            let _ = writeln!(out, "hmac-algorithm={algo}");
        }
        out.into_bytes()
    }
}

fn is_alphanum_dash(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn set_bool(slot: &mut Option<bool>, key: &str, value: &str) -> Result<()> {
    if slot.is_some() {
        return Err(HeaderError::DuplicateKey(key.to_owned()));
    }
    *slot = Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    ));
    Ok(())
}

fn set_string(slot: &mut Option<String>, key: &str, value: &str) -> Result<()> {
    if slot.is_some() {
        return Err(HeaderError::DuplicateKey(key.to_owned()));
    }
    *slot = Some(value.to_owned());
    Ok(())
}
