//! Shared fixtures for the integration suites: an in-memory host inventory
//! over a temporary directory tree, and helpers to fabricate VMs with
//! on-disk payloads.

#![allow(dead_code)]

use arca::{
    Catalog, CatalogError, EngineConfig, Inventory, LocalVm, MacAlgorithm, VmEntry, VmKind,
};
use rand::prelude::*;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A fake host: catalog plus a directory tree holding VM payloads
pub struct TestHost {
    pub root: PathBuf,
    pub catalog: Catalog,
    pub vms: Vec<LocalVm>,
    pub registered: Vec<VmEntry>,
    pub timestamps: HashMap<String, u64>,
    pub default_template: Option<String>,
    pub default_netvm: Option<String>,
}

impl TestHost {
    pub fn new(root: &Path) -> TestHost {
        fs::create_dir_all(root.join("home")).unwrap();
        fs::create_dir_all(root.join("vms")).unwrap();
        TestHost {
            root: root.to_owned(),
            catalog: Catalog::default(),
            vms: Vec::new(),
            registered: Vec::new(),
            timestamps: HashMap::new(),
            default_template: Some("fedora-default".to_owned()),
            default_netvm: None,
        }
    }

    /// Adds a VM whose private image holds `private_size` pseudo-random
    /// bytes
    pub fn add_vm(&mut self, name: &str, qid: u32, private_size: usize) -> PathBuf {
        let dir = self.root.join("vms").join(name);
        fs::create_dir_all(&dir).unwrap();
        let private_img = dir.join("private.img");
        let mut data = vec![0_u8; private_size];
        StdRng::seed_from_u64(u64::from(qid)).fill_bytes(&mut data);
        fs::write(&private_img, &data).unwrap();

        let entry = entry(name, qid, VmKind::App);
        self.catalog.insert(entry.clone()).unwrap();
        self.vms.push(LocalVm {
            entry,
            dir_path: dir,
            private_img: Some(private_img.clone()),
            root_img: None,
            icon_path: None,
            firewall_conf: None,
            extension_files: Vec::new(),
            running: false,
        });
        private_img
    }

    /// Adds the management domain, backing the admin home directory
    pub fn add_admin(&mut self) {
        let entry = entry("dom0", 0, VmKind::Standalone);
        self.catalog.insert(entry.clone()).unwrap();
        self.vms.push(LocalVm {
            entry,
            dir_path: self.root.join("home"),
            private_img: None,
            root_img: None,
            icon_path: None,
            firewall_conf: None,
            extension_files: Vec::new(),
            running: false,
        });
    }

    pub fn home_file(&self, name: &str, contents: &[u8]) {
        fs::write(self.root.join("home").join(name), contents).unwrap();
    }

    pub fn admin_home_path(&self) -> PathBuf {
        self.root.join("home")
    }
}

impl Inventory for TestHost {
    fn live_catalog(&self) -> Catalog {
        self.catalog.clone()
    }

    fn backup_vms(&self) -> Vec<LocalVm> {
        self.vms.clone()
    }

    fn default_template(&self) -> Option<String> {
        self.default_template.clone()
    }

    fn default_netvm(&self) -> Option<String> {
        self.default_netvm.clone()
    }

    fn admin_user(&self) -> String {
        "user".to_owned()
    }

    fn admin_home(&self) -> PathBuf {
        self.root.join("home")
    }

    fn vm_dir(&self, name: &str) -> PathBuf {
        self.root.join("vms").join(name)
    }

    fn register_vm(&mut self, entry: &VmEntry) -> Result<(), CatalogError> {
        self.registered.push(entry.clone());
        self.catalog.insert(entry.clone())
    }

    fn set_backup_timestamp(&mut self, name: &str, timestamp: u64) {
        self.timestamps.insert(name.to_owned(), timestamp);
    }
}

pub fn entry(name: &str, qid: u32, kind: VmKind) -> VmEntry {
    VmEntry {
        qid,
        name: name.to_owned(),
        label: "red".to_owned(),
        kind,
        template: None,
        netvm: None,
        provides_network: false,
        updatable: false,
        include_in_backups: true,
        backup_content: false,
        backup_path: None,
        backup_size: None,
        backup_timestamp: None,
    }
}

/// Engine config pointed at a private scratch root, with a small chunk
/// size so multi-chunk members stay cheap
pub fn test_config(scratch_root: &Path, chunk_size: u64) -> EngineConfig {
    fs::create_dir_all(scratch_root).unwrap();
    EngineConfig {
        scratch_root: scratch_root.to_owned(),
        chunk_size,
        default_mac: MacAlgorithm::Sha512,
        ..EngineConfig::default()
    }
}

/// Names of entries in an outer archive, in order
pub fn archive_entry_names(archive_path: &Path) -> Vec<String> {
    let file = fs::File::open(archive_path).unwrap();
    let mut archive = tar::Archive::new(file);
    archive.set_ignore_zeros(true);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            String::from_utf8(entry.unwrap().path_bytes().into_owned()).unwrap()
        })
        .collect()
}

/// Sizes of entries in an outer archive, keyed by name
pub fn archive_entry_sizes(archive_path: &Path) -> Vec<(String, u64)> {
    let file = fs::File::open(archive_path).unwrap();
    let mut archive = tar::Archive::new(file);
    archive.set_ignore_zeros(true);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let name = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
            (name, entry.size())
        })
        .collect()
}

/// Byte offset of a member's data inside the outer archive, for tamper
/// tests
pub fn archive_data_offset(archive_path: &Path, member: &str) -> u64 {
    let file = fs::File::open(archive_path).unwrap();
    let mut archive = tar::Archive::new(file);
    archive.set_ignore_zeros(true);
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        let name = String::from_utf8(entry.path_bytes().into_owned()).unwrap();
        if name == member {
            return entry.raw_file_position();
        }
    }
    panic!("member {member} not found in {}", archive_path.display());
}

/// Asserts that a scratch root holds no leftover run directories
pub fn assert_scratch_empty(scratch_root: &Path) {
    let leftovers: Vec<_> = fs::read_dir(scratch_root)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "scratch leftovers: {leftovers:?}");
}
