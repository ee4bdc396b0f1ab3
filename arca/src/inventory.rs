//! The narrow contract the engine requires of the host's VM object model.
//!
//! The management stack's full object model is out of scope here; the
//! pipelines only need to enumerate VMs with their on-disk files, snapshot
//! and update the catalog, and commit restored VMs. Callers implement
//! [`Inventory`] over whatever the real model is; tests use an in-memory
//! one.

use arca_core::catalog::{Catalog, CatalogError, VmEntry};

use std::path::PathBuf;

/// Host-side view of one VM eligible for backup: its catalog entry plus the
/// files that make up its persistent state.
#[derive(Clone, Debug)]
pub struct LocalVm {
    pub entry: VmEntry,
    /// The VM's directory on the host
    pub dir_path: PathBuf,
    pub private_img: Option<PathBuf>,
    /// Only backed up for updatable VMs
    pub root_img: Option<PathBuf>,
    pub icon_path: Option<PathBuf>,
    pub firewall_conf: Option<PathBuf>,
    /// Files contributed by the extension framework
    pub extension_files: Vec<PathBuf>,
    pub running: bool,
}

/// What the engine needs from the host.
///
/// Queries drive selection and planning; the mutating methods are how
/// restored VMs and backup bookkeeping reach the live catalog.
pub trait Inventory {
    /// Snapshot of the live catalog
    fn live_catalog(&self) -> Catalog;

    /// VMs eligible for backup, with their files. The management domain
    /// appears with qid 0; its files are ignored in favor of
    /// [`Inventory::admin_home`].
    fn backup_vms(&self) -> Vec<LocalVm>;

    /// Name of the template used when a backed-up VM's template is absent
    fn default_template(&self) -> Option<String>;

    /// Name of the netvm used when a backed-up VM's netvm is absent
    fn default_netvm(&self) -> Option<String>;

    /// The admin user whose home directory backs the management domain
    fn admin_user(&self) -> String;

    fn admin_home(&self) -> PathBuf;

    /// Where a VM's files live (or will live, for a VM being restored)
    fn vm_dir(&self, name: &str) -> PathBuf;

    /// Commits a restored VM into the live catalog
    fn register_vm(&mut self, entry: &VmEntry) -> Result<(), CatalogError>;

    /// Records a successful backup of a VM
    fn set_backup_timestamp(&mut self, name: &str, timestamp: u64);
}
