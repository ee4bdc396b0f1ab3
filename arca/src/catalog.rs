//! Reading and writing the catalog snapshot carried inside an archive.
//!
//! On the way out, the live catalog is snapshotted with the backup feature
//! triple set on every included VM, so restore can re-identify each VM's
//! files. On the way in, the document bytes stay untrusted until the
//! consumer pipeline has extracted and verified them; only then does a
//! parser, selected by header version, turn them into VM records.

use arca_core::catalog::{Catalog, CatalogError, VmEntry, VmKind};
use tracing::debug;

/// Turns verified catalog bytes into VM records.
///
/// The contract is deliberately small: bytes in, records out, or fail. The
/// engine selects an implementation from the header version, so legacy
/// archives keep working without the current codec learning their format.
pub trait CatalogParser {
    fn parse(&self, bytes: &[u8]) -> Result<Catalog, CatalogError>;
}

/// Catalog codec of format versions 2 and up
pub struct CurrentCatalog;

impl CatalogParser for CurrentCatalog {
    fn parse(&self, bytes: &[u8]) -> Result<Catalog, CatalogError> {
        Catalog::decode(bytes)
    }
}

/// The plaintext catalog of version-1 archives: one VM per line,
/// whitespace-separated `name qid kind label template netvm`, with `-`
/// standing for "none". Lines starting with `#` are comments.
pub struct LegacyCatalog;

impl CatalogParser for LegacyCatalog {
    fn parse(&self, bytes: &[u8]) -> Result<Catalog, CatalogError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CatalogError::MalformedLegacy("not UTF-8".to_owned()))?;
        let mut catalog = Catalog::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 6 {
                return Err(CatalogError::MalformedLegacy(line.to_owned()));
            }
            let qid: u32 = fields[1]
                .parse()
                .map_err(|_| CatalogError::MalformedLegacy(line.to_owned()))?;
            let kind = match fields[2] {
                "app" => VmKind::App,
                "template" => VmKind::Template,
                "standalone" => VmKind::Standalone,
                _ => return Err(CatalogError::MalformedLegacy(line.to_owned())),
            };
            let optional = |field: &str| {
                if field == "-" {
                    None
                } else {
                    Some(field.to_owned())
                }
            };
            catalog.insert(VmEntry {
                qid,
                name: fields[0].to_owned(),
                label: fields[3].to_owned(),
                kind,
                template: optional(fields[4]),
                netvm: optional(fields[5]),
                provides_network: false,
                updatable: kind != VmKind::App,
                include_in_backups: true,
                backup_content: true,
                backup_path: Some(format!("{}/", fields[0])),
                backup_size: None,
                backup_timestamp: None,
            })?;
        }
        Ok(catalog)
    }
}

/// Selects the catalog parser matching an archive format version
pub fn parser_for_version(version: u32) -> Result<Box<dyn CatalogParser>, CatalogError> {
    match version {
        1 => Ok(Box::new(LegacyCatalog)),
        2..=4 => Ok(Box::new(CurrentCatalog)),
        other => Err(CatalogError::UnsupportedVersion(other)),
    }
}

/// Builds the snapshot embedded in a new archive: the live catalog with the
/// backup feature triple set on included VMs and cleared everywhere else.
pub fn snapshot_for_backup(
    live: &Catalog,
    included: &[(String, String, u64)],
) -> Catalog {
    let mut snapshot = live.clone();
    for vm in &mut snapshot.vms {
        vm.clear_backup_features();
    }
    for (name, subdir, size) in included {
        if let Some(vm) = snapshot.get_mut(name) {
            vm.backup_content = true;
            vm.backup_path = Some(subdir.clone());
            vm.backup_size = Some(*size);
        } else {
            debug!(name, "included VM missing from live catalog snapshot");
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str, qid: u32) -> VmEntry {
        VmEntry {
            qid,
            name: name.to_owned(),
            label: "black".to_owned(),
            kind: VmKind::App,
            template: None,
            netvm: None,
            provides_network: false,
            updatable: false,
            include_in_backups: true,
            backup_content: true,
            backup_path: Some("stale/".to_owned()),
            backup_size: Some(1),
            backup_timestamp: None,
        }
    }

    #[test]
    fn snapshot_sets_the_feature_triple() {
        let mut live = Catalog::default();
        live.insert(vm("work", 1)).unwrap();
        live.insert(vm("vault", 2)).unwrap();
        let snapshot = snapshot_for_backup(
            &live,
            &[("work".to_owned(), "vm1/".to_owned(), 4096)],
        );

        let work = snapshot.get("work").unwrap();
        assert!(work.backup_content);
        assert_eq!(work.backup_path.as_deref(), Some("vm1/"));
        assert_eq!(work.backup_size, Some(4096));

        let vault = snapshot.get("vault").unwrap();
        assert!(!vault.backup_content);
        assert_eq!(vault.backup_path, None);
    }

    #[test]
    fn legacy_lines_parse() {
        let text = b"# legacy catalog\nwork 1 app red fedora sys-net\nfedora 2 template black - -\n";
        let catalog = LegacyCatalog.parse(text).unwrap();
        assert_eq!(catalog.vms.len(), 2);
        let work = catalog.get("work").unwrap();
        assert_eq!(work.template.as_deref(), Some("fedora"));
        assert_eq!(work.netvm.as_deref(), Some("sys-net"));
        assert!(catalog.get("fedora").unwrap().is_template());
    }

    #[test]
    fn legacy_garbage_rejected() {
        assert!(LegacyCatalog.parse(b"too few fields").is_err());
        assert!(LegacyCatalog.parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn parser_selection_follows_version() {
        assert!(parser_for_version(1).is_ok());
        assert!(parser_for_version(4).is_ok());
        assert!(matches!(
            parser_for_version(9),
            Err(CatalogError::UnsupportedVersion(9))
        ));
    }
}
