/*!
The catalog snapshot carried inside an archive.

The catalog is the VM metadata document as it stood at backup time,
serialized as a single opaque blob and chunked like any other member. Only
the fields the restore planner needs are modeled; everything else the
management stack keeps about a VM stays outside this crate.

The MessagePack encoding of [`Catalog`] is the canonical on-wire form for
format versions 2 and up.
*/

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Member name of the catalog snapshot inside an archive
pub const CATALOG_FILENAME: &str = "catalog";

/// Archive subdir prefix of the management domain's home member
pub const ADMIN_HOME_SUBDIR: &str = "dom0-home";

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog I/O failed")]
    Io(#[from] std::io::Error),
    #[error("failed to decode catalog snapshot")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode catalog snapshot")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("malformed legacy catalog: {0}")]
    MalformedLegacy(String),
    #[error("no catalog parser for format version {0}")]
    UnsupportedVersion(u32),
    #[error("VM {0} already exists in the catalog")]
    DuplicateVm(String),
}

type Result<T> = std::result::Result<T, CatalogError>;

/// Kind of a VM, as far as backup and restore care
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmKind {
    App,
    Template,
    Standalone,
}

/// One VM's entry in the catalog snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmEntry {
    pub qid: u32,
    pub name: String,
    pub label: String,
    pub kind: VmKind,
    pub template: Option<String>,
    pub netvm: Option<String>,
    pub provides_network: bool,
    pub updatable: bool,
    pub include_in_backups: bool,
    /// Feature triple written by the backup engine so restore can find the
    /// VM's files again
    pub backup_content: bool,
    pub backup_path: Option<String>,
    pub backup_size: Option<u64>,
    /// Unix timestamp of the last successful backup of this VM
    pub backup_timestamp: Option<u64>,
}

impl VmEntry {
    pub fn is_template(&self) -> bool {
        self.kind == VmKind::Template
    }

    /// Clears the backup feature triple
    pub fn clear_backup_features(&mut self) {
        self.backup_content = false;
        self.backup_path = None;
        self.backup_size = None;
    }
}

/// The VM metadata document, in catalog order
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub vms: Vec<VmEntry>,
}

impl Catalog {
    pub fn get(&self, name: &str) -> Option<&VmEntry> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut VmEntry> {
        self.vms.iter_mut().find(|vm| vm.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Adds a VM, refusing duplicates by name
    pub fn insert(&mut self, entry: VmEntry) -> Result<()> {
        if self.contains(&entry.name) {
            return Err(CatalogError::DuplicateVm(entry.name));
        }
        self.vms.push(entry);
        Ok(())
    }

    /// Canonical on-wire encoding for format versions 2 and up
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decodes the canonical encoding. The bytes must already have passed
    /// integrity verification; this only has to be safe against garbage, not
    /// clever.
    pub fn decode(bytes: &[u8]) -> Result<Catalog> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn entry(name: &str, qid: u32) -> VmEntry {
        VmEntry {
            qid,
            name: name.to_owned(),
            label: "red".to_owned(),
            kind: VmKind::App,
            template: Some("fedora".to_owned()),
            netvm: Some("sys-net".to_owned()),
            provides_network: false,
            updatable: false,
            include_in_backups: true,
            backup_content: false,
            backup_path: None,
            backup_size: None,
            backup_timestamp: None,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut catalog = Catalog::default();
        catalog.insert(entry("work", 1)).unwrap();
        catalog.insert(entry("personal", 2)).unwrap();
        let bytes = catalog.encode().unwrap();
        let decoded = Catalog::decode(&bytes).unwrap();
        assert_eq!(catalog, decoded);
    }

    #[test]
    fn duplicate_names_refused() {
        let mut catalog = Catalog::default();
        catalog.insert(entry("work", 1)).unwrap();
        assert!(matches!(
            catalog.insert(entry("work", 2)),
            Err(CatalogError::DuplicateVm(_))
        ));
    }

    #[test]
    fn garbage_decode_fails_cleanly() {
        assert!(Catalog::decode(b"not a catalog").is_err());
        assert!(Catalog::decode(&[]).is_err());
    }
}
