/*!
The grammar of member names announced by an archive.

Names arrive from attacker-controlled bytes and are used to create files in
the scratch directory, so they are validated before anything else happens:
only `[A-Za-z0-9_./-]`, components of at most 255 bytes that are plain names
(no empty, `.` or `..` components, no leading slash), and at most 4096 bytes
in total. A trailing `.NNN` of three decimal digits marks a data chunk, and a
trailing `.hmac` marks the companion tag of whatever precedes it.
*/

use thiserror::Error;

/// Byte bound of a whole member path
pub const MAX_PATH_BYTES: usize = 4096;

/// Byte bound of one path component
pub const MAX_COMPONENT_BYTES: usize = 255;

/// Suffix of companion tag members
pub const MAC_SUFFIX: &str = ".hmac";

#[derive(Error, Debug)]
pub enum NameError {
    #[error("unsafe member name: {0:?}")]
    Unsafe(String),
}

type Result<T> = std::result::Result<T, NameError>;

/// A classified member name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberName {
    /// The member path with chunk and tag suffixes stripped
    pub member: String,
    /// Chunk sequence number, when the name carried a `.NNN` suffix
    pub seq: Option<u32>,
    /// Whether the name carried the `.hmac` suffix
    pub is_mac: bool,
}

impl MemberName {
    /// The on-wire name of the data chunk `seq` of `member`
    pub fn chunk(member: &str, seq: u32) -> String {
        format!("{member}.{seq:03}")
    }

    /// The on-wire name of the tag companion of `data_name`
    pub fn mac_companion(data_name: &str) -> String {
        format!("{data_name}{MAC_SUFFIX}")
    }
}

/// Validates an untrusted member name and classifies it.
///
/// Rejection is deliberately coarse: anything outside the grammar is
/// `Unsafe`, with no attempt to repair.
pub fn classify(untrusted_name: &str) -> Result<MemberName> {
    validate(untrusted_name)?;

    let (rest, is_mac) = match untrusted_name.strip_suffix(MAC_SUFFIX) {
        Some(rest) if !rest.is_empty() => (rest, true),
        Some(_) => return Err(NameError::Unsafe(untrusted_name.to_owned())),
        None => (untrusted_name, false),
    };

    let (member, seq) = match chunk_suffix(rest) {
        Some((member, seq)) => (member, Some(seq)),
        None => (rest, None),
    };
    if member.is_empty() {
        return Err(NameError::Unsafe(untrusted_name.to_owned()));
    }
    Ok(MemberName {
        member: member.to_owned(),
        seq,
        is_mac,
    })
}

/// Checks the raw grammar without classifying
pub fn validate(untrusted_name: &str) -> Result<()> {
    let unsafe_name = || NameError::Unsafe(untrusted_name.to_owned());
    if untrusted_name.is_empty() || untrusted_name.len() > MAX_PATH_BYTES {
        return Err(unsafe_name());
    }
    if !untrusted_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'))
    {
        return Err(unsafe_name());
    }
    for component in untrusted_name.split('/') {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.len() > MAX_COMPONENT_BYTES
        {
            return Err(unsafe_name());
        }
    }
    Ok(())
}

fn chunk_suffix(name: &str) -> Option<(&str, u32)> {
    let (member, digits) = name.rsplit_once('.')?;
    if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((member, digits.parse().ok()?))
}
