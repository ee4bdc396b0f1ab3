//! A file-backed host inventory: the narrow slice of the management stack
//! the engine needs, persisted as a catalog document under the inventory
//! root.
//!
//! Layout: `<root>/catalog.mp` holds the encoded catalog;
//! `<root>/vms/<name>/` holds each VM's files under conventional names;
//! `<root>/default-template` and `<root>/default-netvm`, when present, name
//! the host defaults.

use anyhow::{Context, Result};
use arca::{Catalog, CatalogError, Inventory, LocalVm, VmEntry};

use std::fs;
use std::path::{Path, PathBuf};

const CATALOG_FILE: &str = "catalog.mp";

pub struct FsInventory {
    root: PathBuf,
    catalog: Catalog,
}

impl FsInventory {
    pub fn load(root: &Path) -> Result<FsInventory> {
        let catalog_path = root.join(CATALOG_FILE);
        let catalog = if catalog_path.exists() {
            let bytes = fs::read(&catalog_path)
                .with_context(|| format!("reading {}", catalog_path.display()))?;
            Catalog::decode(&bytes)
                .with_context(|| format!("decoding {}", catalog_path.display()))?
        } else {
            Catalog::default()
        };
        Ok(FsInventory {
            root: root.to_owned(),
            catalog,
        })
    }

    fn save(&self) -> Result<(), CatalogError> {
        let bytes = self.catalog.encode()?;
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(CATALOG_FILE), bytes)?;
        Ok(())
    }

    fn named_default(&self, file: &str) -> Option<String> {
        let text = fs::read_to_string(self.root.join(file)).ok()?;
        let name = text.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_owned())
        }
    }

    fn probe(dir: &Path, file: &str) -> Option<PathBuf> {
        let path = dir.join(file);
        path.exists().then_some(path)
    }
}

impl Inventory for FsInventory {
    fn live_catalog(&self) -> Catalog {
        self.catalog.clone()
    }

    fn backup_vms(&self) -> Vec<LocalVm> {
        self.catalog
            .vms
            .iter()
            .map(|entry| {
                let dir = self.vm_dir(&entry.name);
                LocalVm {
                    entry: entry.clone(),
                    private_img: Self::probe(&dir, "private.img"),
                    root_img: Self::probe(&dir, "root.img"),
                    icon_path: Self::probe(&dir, "icon.png"),
                    firewall_conf: Self::probe(&dir, "firewall.xml"),
                    extension_files: Vec::new(),
                    running: dir.join("running").exists(),
                    dir_path: dir,
                }
            })
            .collect()
    }

    fn default_template(&self) -> Option<String> {
        self.named_default("default-template")
    }

    fn default_netvm(&self) -> Option<String> {
        self.named_default("default-netvm")
    }

    fn admin_user(&self) -> String {
        std::env::var("USER").unwrap_or_else(|_| "root".to_owned())
    }

    fn admin_home(&self) -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join("home"))
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join("vms").join(name)
    }

    fn register_vm(&mut self, entry: &VmEntry) -> Result<(), CatalogError> {
        self.catalog.insert(entry.clone())?;
        self.save()
    }

    fn set_backup_timestamp(&mut self, name: &str, timestamp: u64) {
        if let Some(vm) = self.catalog.get_mut(name) {
            vm.backup_timestamp = Some(timestamp);
        }
        let _ = self.save();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca::VmKind;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut inventory = FsInventory::load(dir.path()).unwrap();
        assert!(inventory.live_catalog().vms.is_empty());

        let entry = VmEntry {
            qid: 1,
            name: "work".to_owned(),
            label: "red".to_owned(),
            kind: VmKind::App,
            template: None,
            netvm: None,
            provides_network: false,
            updatable: false,
            include_in_backups: true,
            backup_content: false,
            backup_path: None,
            backup_size: None,
            backup_timestamp: None,
        };
        inventory.register_vm(&entry).unwrap();

        let reloaded = FsInventory::load(dir.path()).unwrap();
        assert!(reloaded.live_catalog().contains("work"));
    }

    #[test]
    fn vm_files_probed_by_convention() {
        let dir = tempfile::tempdir().unwrap();
        let vm_dir = dir.path().join("vms/work");
        fs::create_dir_all(&vm_dir).unwrap();
        fs::write(vm_dir.join("private.img"), b"data").unwrap();

        let mut inventory = FsInventory::load(dir.path()).unwrap();
        inventory
            .register_vm(&VmEntry {
                qid: 1,
                name: "work".to_owned(),
                label: "red".to_owned(),
                kind: VmKind::App,
                template: None,
                netvm: None,
                provides_network: false,
                updatable: false,
                include_in_backups: true,
                backup_content: false,
                backup_path: None,
                backup_size: None,
                backup_timestamp: None,
            })
            .unwrap();
        let vms = inventory.backup_vms();
        assert_eq!(vms.len(), 1);
        assert!(vms[0].private_img.is_some());
        assert!(vms[0].root_img.is_none());
    }
}
