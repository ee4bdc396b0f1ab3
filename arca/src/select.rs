//! Backup selection: which VMs, which of their files, and how big the
//! archive will be.

use crate::backup::BackupError;
use crate::fsutil::{disk_usage, size_to_human};
use crate::inventory::{Inventory, LocalVm};
use arca_core::catalog::ADMIN_HOME_SUBDIR;
use tracing::debug;

use std::fmt::Write as _;
use std::path::PathBuf;

/// One file (or directory tree) headed into the archive
#[derive(Clone, Debug)]
pub struct FileToBackup {
    pub path: PathBuf,
    pub size: u64,
    /// Member name the file is rewritten to inside the archive
    pub member: String,
    /// Whether symlinks are followed when archiving (they are for VM
    /// images, not for the admin home)
    pub dereference: bool,
}

/// One VM's slice of the backup
#[derive(Clone, Debug)]
pub struct VmToBackup {
    pub vm: LocalVm,
    pub files: Vec<FileToBackup>,
    /// Archive subdir holding this VM's files, recorded in the catalog
    /// snapshot as `backup-path`
    pub subdir: String,
}

impl VmToBackup {
    pub fn size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Enumerates the VMs and files a backup run will cover.
///
/// `selection` of `None` means every VM that opts in; the exclude list is
/// always applied. VMs come back sorted by qid so the archive order is
/// stable. The management domain (qid 0) contributes the admin user's home
/// directory under `dom0-home/`.
pub fn files_to_backup<I: Inventory>(
    app: &I,
    selection: Option<&[String]>,
    exclude: &[String],
    encrypted: bool,
) -> Result<Vec<VmToBackup>, BackupError> {
    let mut picked: Vec<LocalVm> = app
        .backup_vms()
        .into_iter()
        .filter(|vm| match selection {
            Some(names) => names.contains(&vm.entry.name),
            None => vm.entry.include_in_backups,
        })
        .filter(|vm| !exclude.contains(&vm.entry.name))
        .collect();
    picked.sort_by_key(|vm| vm.entry.qid);

    if let Some(names) = selection {
        for name in names {
            if !picked.iter().any(|vm| &vm.entry.name == name) {
                return Err(BackupError::NoSuchVm(name.clone()));
            }
        }
    }

    let mut result = Vec::with_capacity(picked.len());
    for vm in picked {
        if vm.entry.qid == 0 {
            let home = app.admin_home();
            let size = disk_usage(&home)?;
            let user = app.admin_user();
            result.push(VmToBackup {
                subdir: format!("{ADMIN_HOME_SUBDIR}/{user}"),
                files: vec![FileToBackup {
                    path: home,
                    size,
                    // the home tree travels under the admin user's name,
                    // which restore reads back out of the member path
                    member: format!("{ADMIN_HOME_SUBDIR}/{user}"),
                    dereference: false,
                }],
                vm,
            });
            continue;
        }

        let subdir = if encrypted {
            format!("vm{}/", vm.entry.qid)
        } else {
            format!("{}/", vm.entry.name)
        };

        let mut files = Vec::new();
        let mut push = |path: &PathBuf| -> Result<(), BackupError> {
            let basename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(FileToBackup {
                path: path.clone(),
                size: disk_usage(path)?,
                member: format!("{subdir}{basename}"),
                dereference: true,
            });
            Ok(())
        };
        if let Some(private_img) = &vm.private_img {
            push(private_img)?;
        }
        if let Some(icon) = &vm.icon_path {
            push(icon)?;
        }
        for extra in &vm.extension_files {
            push(extra)?;
        }
        if let Some(firewall) = &vm.firewall_conf {
            if firewall.exists() {
                push(firewall)?;
            }
        }
        if vm.entry.updatable {
            if let Some(root_img) = &vm.root_img {
                push(root_img)?;
            }
        }
        debug!(vm = %vm.entry.name, files = files.len(), "selected for backup");
        result.push(VmToBackup {
            subdir: subdir.trim_end_matches('/').to_owned() + "/",
            files,
            vm,
        });
    }
    Ok(result)
}

/// Total bytes a backup of this selection will read
pub fn total_size(vms: &[VmToBackup]) -> u64 {
    vms.iter().map(VmToBackup::size).sum()
}

/// The human summary shown before a backup run
pub fn backup_summary(vms: &[VmToBackup], not_selected: &[String]) -> String {
    let mut out = String::new();
    let rule = format!("{:-<18}-+-{:-<13}-+-{:-<13}-+\n", "", "", "");
    out.push_str(&rule);
    let _ = writeln!(out, "{:>18} | {:>13} | {:>13} |", "VM", "type", "size");
    out.push_str(&rule);
    for vm in vms {
        let kind = if vm.vm.entry.qid == 0 {
            "User home".to_owned()
        } else if vm.vm.entry.is_template() {
            "Template VM".to_owned()
        } else if vm.vm.entry.updatable {
            "VM + Sys".to_owned()
        } else {
            "VM".to_owned()
        };
        let _ = write!(
            out,
            "{:>18} | {:>13} | {:>13} |",
            vm.vm.entry.name,
            kind,
            size_to_human(vm.size())
        );
        if vm.vm.entry.qid != 0 && vm.vm.running {
            out.push_str(" <-- The VM is running, shut it down before the backup!");
        }
        out.push('\n');
    }
    out.push_str(&rule);
    let _ = writeln!(
        out,
        "{:>18} | {:>29} |",
        "Total size:",
        size_to_human(total_size(vms))
    );
    out.push_str(&rule);
    let mut not_selected: Vec<&String> = not_selected.iter().collect();
    not_selected.sort();
    out.push_str("VMs not selected for backup:\n");
    for name in not_selected {
        let _ = writeln!(out, " - {name}");
    }
    out
}
