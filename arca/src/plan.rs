//! Restore planning: which VMs come out of the archive, under which names,
//! wired to which templates and netvms, and which of them cannot proceed.
//!
//! Planning never touches the filesystem; it folds the backup catalog, the
//! host catalog, and the user's options into a deterministic per-VM action
//! set. Problems are not errors: they change the plan's shape and the
//! summary, and the caller decides whether to proceed.

use arca_core::catalog::{Catalog, VmEntry, ADMIN_HOME_SUBDIR};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

/// Longest VM-name prefix kept when renaming a conflicting VM
const RENAME_PREFIX_MAX: usize = 29;

/// Renaming gives up after this many candidates
const RENAME_ATTEMPTS: u32 = 100;

/// Options steering the restore plan
#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// Substitute the host default when a referenced template is missing
    pub use_default_template: bool,
    /// Substitute the host default when a referenced netvm is missing
    pub use_default_netvm: bool,
    /// Detach from the network when a referenced netvm is missing
    pub use_none_netvm: bool,
    /// Restore the management domain's home directory
    pub restore_admin_home: bool,
    /// Restore the home directory even when the stored username differs
    pub ignore_username_mismatch: bool,
    /// Templates to substitute regardless of availability, old name to new
    pub replace_template: HashMap<String, String>,
    /// Verify archive integrity without writing any file
    pub verify_only: bool,
    /// Rename a restored VM when its name is taken on the host
    pub rename_conflicting: bool,
    /// Skip members that fail verification or VMs with unresolved problems
    /// instead of failing the run
    pub skip_broken: bool,
    /// Proceed despite missing templates and netvms by substituting
    /// defaults
    pub ignore_missing: bool,
    /// VM names excluded from the restore
    pub exclude: Vec<String>,
    /// Accept headerless legacy version-1 archives
    pub allow_legacy_v1: bool,
}

impl Default for RestoreOptions {
    fn default() -> RestoreOptions {
        RestoreOptions {
            use_default_template: true,
            use_default_netvm: true,
            use_none_netvm: false,
            restore_admin_home: true,
            ignore_username_mismatch: false,
            replace_template: HashMap::new(),
            verify_only: false,
            rename_conflicting: true,
            skip_broken: false,
            ignore_missing: false,
            exclude: Vec::new(),
            allow_legacy_v1: false,
        }
    }
}

/// Why a planned VM cannot be restored as-is
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Problem {
    Excluded,
    AlreadyExists,
    MissingTemplate,
    MissingNetvm,
    UsernameMismatch,
}

/// One VM's slot in the restore plan
#[derive(Clone, Debug, PartialEq)]
pub struct VmToRestore {
    /// The VM's entry from the backup catalog
    pub vm: VmEntry,
    /// Archive subdir holding its files
    pub subdir: String,
    pub size: u64,
    /// Name the VM will get on the host, possibly renamed
    pub name: String,
    /// Template resolved against the host
    pub template: Option<String>,
    /// Netvm resolved against the host
    pub netvm: Option<String>,
    /// The template named in the backup, when a substitution happened
    pub orig_template: Option<String>,
    pub problems: BTreeSet<Problem>,
    /// Username carried by the management-home member, when this slot is
    /// the management domain
    pub username: Option<String>,
}

impl VmToRestore {
    fn from_entry(entry: &VmEntry) -> VmToRestore {
        VmToRestore {
            subdir: entry.backup_path.clone().unwrap_or_default(),
            size: entry.backup_size.unwrap_or(0),
            name: entry.name.clone(),
            template: entry.template.clone(),
            netvm: entry.netvm.clone(),
            orig_template: None,
            problems: BTreeSet::new(),
            username: None,
            vm: entry.clone(),
        }
    }

    /// A VM is good to go iff nothing stands in its way
    pub fn good_to_go(&self) -> bool {
        self.problems.is_empty()
    }
}

/// The full plan, keyed by the VM's name in the backup
pub type RestoreInfo = BTreeMap<String, VmToRestore>;

/// The slice of host state planning resolves against
#[derive(Clone, Debug)]
pub struct HostView {
    pub catalog: Catalog,
    pub default_template: Option<String>,
    pub default_netvm: Option<String>,
    pub admin_user: String,
}

/// Builds the plan from a verified backup catalog.
///
/// Running this twice over the same inputs yields the same plan.
pub fn restore_info(
    backup_catalog: &Catalog,
    host: &HostView,
    options: &RestoreOptions,
) -> RestoreInfo {
    let mut info: RestoreInfo = BTreeMap::new();
    for entry in &backup_catalog.vms {
        if entry.qid == 0 || !entry.backup_content {
            continue;
        }
        let mut slot = VmToRestore::from_entry(entry);
        if let Some(template) = &slot.template {
            if let Some(replacement) = options.replace_template.get(template) {
                slot.orig_template = Some(template.clone());
                slot.template = Some(replacement.clone());
            }
        }
        info.insert(entry.name.clone(), slot);
    }

    verify(&mut info, host, options);

    if options.restore_admin_home {
        if let Some(admin) = backup_catalog.vms.iter().find(|vm| vm.qid == 0) {
            if admin.backup_content {
                let mut slot = VmToRestore::from_entry(admin);
                let username = slot
                    .subdir
                    .rsplit('/')
                    .find(|part| !part.is_empty())
                    .unwrap_or_default()
                    .to_owned();
                if username != host.admin_user && !options.ignore_username_mismatch {
                    slot.problems.insert(Problem::UsernameMismatch);
                }
                slot.username = Some(username);
                info.insert(admin.name.clone(), slot);
            }
        }
    }

    info
}

/// Re-resolves every plan slot against the host, in the fixed policy order
fn verify(info: &mut RestoreInfo, host: &HostView, options: &RestoreOptions) {
    let names: Vec<String> = info.keys().cloned().collect();
    for name in names {
        // worked on a clone so the rest of the plan can be consulted
        let mut slot = info[&name].clone();
        slot.problems.clear();

        if options.exclude.contains(&name) {
            slot.problems.insert(Problem::Excluded);
        }

        if !options.verify_only && host.catalog.contains(&name) {
            let renamed = if options.rename_conflicting {
                rename_conflicting(&name, info, &host.catalog)
            } else {
                None
            };
            match renamed {
                Some(new_name) => slot.name = new_name,
                None => {
                    slot.problems.insert(Problem::AlreadyExists);
                }
            }
        }

        if let Some(template) = slot.template.clone() {
            let on_host = host
                .catalog
                .get(&template)
                .map(VmEntry::is_template)
                .unwrap_or(false);
            let in_backup = info
                .get(&template)
                .map(|other| other.good_to_go() && other.vm.is_template())
                .unwrap_or(false);
            if !on_host && !in_backup {
                let substitute = options.use_default_template || options.ignore_missing;
                match (&host.default_template, substitute) {
                    (Some(default), true) => {
                        if slot.orig_template.is_none() {
                            slot.orig_template = Some(template);
                        }
                        slot.template = Some(default.clone());
                    }
                    _ => {
                        slot.problems.insert(Problem::MissingTemplate);
                    }
                }
            }
        }

        if let Some(netvm) = slot.netvm.clone() {
            let on_host = host
                .catalog
                .get(&netvm)
                .map(|vm| vm.provides_network)
                .unwrap_or(false);
            let in_backup = info
                .get(&netvm)
                .map(|other| other.good_to_go() && other.vm.provides_network)
                .unwrap_or(false);
            if !on_host && !in_backup {
                if options.use_default_netvm || options.ignore_missing {
                    slot.netvm = host.default_netvm.clone();
                } else if options.use_none_netvm {
                    slot.netvm = None;
                } else {
                    slot.problems.insert(Problem::MissingNetvm);
                }
            }
        }

        info.insert(name, slot);
    }
}

/// Picks `{prefix}{N}` with the smallest free `N`, checking the host
/// catalog, the plan's original names, and the plan's already-assigned
/// target names. Gives up after 100 candidates.
fn rename_conflicting(
    orig_name: &str,
    info: &RestoreInfo,
    host_catalog: &Catalog,
) -> Option<String> {
    let prefix: String = orig_name.chars().take(RENAME_PREFIX_MAX).collect();
    for n in 1..RENAME_ATTEMPTS {
        let candidate = format!("{prefix}{n}");
        let taken = host_catalog.contains(&candidate)
            || info.contains_key(&candidate)
            || info.values().any(|slot| slot.name == candidate);
        if !taken {
            return Some(candidate);
        }
    }
    None
}

/// The deterministic human summary of a plan
pub fn restore_summary(info: &RestoreInfo) -> String {
    let mut out = String::new();
    out.push_str("The following VMs are included in the backup:\n\n");
    let rule = format!("{:-<20}-+-{:-<10}-+-{:-<20}-+-{:-<20}-+-{:-<10}-+\n", "", "", "", "", "");
    out.push_str(&rule);
    let _ = writeln!(
        out,
        "{:>20} | {:>10} | {:>20} | {:>20} | {:>10} |",
        "name", "type", "template", "netvm", "label"
    );
    out.push_str(&rule);
    for (name, slot) in info {
        if slot.username.is_some() {
            continue;
        }
        let kind = match slot.vm.kind {
            arca_core::catalog::VmKind::App => "App",
            arca_core::catalog::VmKind::Template => "Tpl",
            arca_core::catalog::VmKind::Standalone => "Standalone",
        };
        let _ = write!(
            out,
            "{:>20} | {:>10} | {:>20} | {:>20} | {:>10} |",
            name,
            kind,
            slot.template.as_deref().unwrap_or("n/a"),
            slot.netvm.as_deref().unwrap_or("-"),
            slot.vm.label,
        );
        if slot.problems.contains(&Problem::Excluded) {
            out.push_str(" <-- Excluded from restore");
        } else if slot.problems.contains(&Problem::AlreadyExists) {
            out.push_str(" <-- A VM with the same name already exists on the host!");
        } else if slot.problems.contains(&Problem::MissingTemplate) {
            out.push_str(" <-- No matching template on the host or in the backup found!");
        } else if slot.problems.contains(&Problem::MissingNetvm) {
            out.push_str(" <-- No matching netvm on the host or in the backup found!");
        } else {
            if let Some(orig) = &slot.orig_template {
                let _ = write!(out, " <-- Original template was '{orig}'");
            }
            if slot.name != slot.vm.name {
                let _ = write!(out, " <-- Will be renamed to '{}'", slot.name);
            }
        }
        out.push('\n');
    }
    for slot in info.values() {
        if let Some(username) = &slot.username {
            let _ = write!(
                out,
                "{:>20} | {:>10} | {:>20} | {:>20} | {:>10} |",
                "Dom0", "Home", "", "", ""
            );
            if slot.problems.contains(&Problem::UsernameMismatch) {
                let _ = write!(
                    out,
                    " <-- username in backup ('{username}') and on the host mismatch"
                );
            }
            out.push('\n');
        }
    }
    out
}

/// The archive subdir prefixes a plan accepts from the transport
pub fn accepted_prefixes(info: &RestoreInfo) -> Vec<String> {
    let mut prefixes = Vec::new();
    for slot in info.values() {
        if !slot.good_to_go() {
            continue;
        }
        if slot.username.is_some() {
            prefixes.push(format!("{ADMIN_HOME_SUBDIR}/"));
        } else if !slot.subdir.is_empty() {
            prefixes.push(slot.subdir.clone());
        }
    }
    prefixes.sort();
    prefixes.dedup();
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_core::catalog::VmKind;

    fn entry(name: &str, qid: u32, kind: VmKind) -> VmEntry {
        VmEntry {
            qid,
            name: name.to_owned(),
            label: "red".to_owned(),
            kind,
            template: None,
            netvm: None,
            provides_network: false,
            updatable: kind != VmKind::App,
            include_in_backups: true,
            backup_content: true,
            backup_path: Some(format!("vm{qid}/")),
            backup_size: Some(1024),
            backup_timestamp: None,
        }
    }

    fn host(vms: Vec<VmEntry>) -> HostView {
        let mut catalog = Catalog::default();
        for vm in vms {
            catalog.insert(vm).unwrap();
        }
        HostView {
            catalog,
            default_template: Some("fedora-default".to_owned()),
            default_netvm: Some("sys-net".to_owned()),
            admin_user: "user".to_owned(),
        }
    }

    fn backup_with(vms: Vec<VmEntry>) -> Catalog {
        let mut catalog = Catalog::default();
        for vm in vms {
            catalog.insert(vm).unwrap();
        }
        catalog
    }

    #[test]
    fn conflicting_vm_gets_renamed() {
        let backup = backup_with(vec![entry("work", 1, VmKind::App)]);
        let host = host(vec![entry("work", 7, VmKind::App)]);
        let info = restore_info(&backup, &host, &RestoreOptions::default());
        assert_eq!(info["work"].name, "work1");
        assert!(info["work"].good_to_go());
    }

    #[test]
    fn rename_skips_taken_numbers() {
        let backup = backup_with(vec![entry("work", 1, VmKind::App)]);
        let host = host(
            ["work", "work1", "work2", "work3", "work4"]
                .iter()
                .enumerate()
                .map(|(i, name)| entry(name, i as u32 + 1, VmKind::App))
                .collect(),
        );
        let info = restore_info(&backup, &host, &RestoreOptions::default());
        assert_eq!(info["work"].name, "work5");
    }

    #[test]
    fn conflict_without_rename_is_a_problem() {
        let backup = backup_with(vec![entry("work", 1, VmKind::App)]);
        let host = host(vec![entry("work", 7, VmKind::App)]);
        let options = RestoreOptions {
            rename_conflicting: false,
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert!(info["work"].problems.contains(&Problem::AlreadyExists));
    }

    #[test]
    fn missing_template_substituted_with_default() {
        let mut vm = entry("x", 1, VmKind::App);
        vm.template = Some("fedora-custom".to_owned());
        let backup = backup_with(vec![vm]);
        let host = host(vec![]);
        let info = restore_info(&backup, &host, &RestoreOptions::default());
        let slot = &info["x"];
        assert_eq!(slot.template.as_deref(), Some("fedora-default"));
        assert_eq!(slot.orig_template.as_deref(), Some("fedora-custom"));
        assert!(slot.good_to_go());
    }

    #[test]
    fn missing_template_without_substitution_is_a_problem() {
        let mut vm = entry("x", 1, VmKind::App);
        vm.template = Some("fedora-custom".to_owned());
        let backup = backup_with(vec![vm]);
        let host = host(vec![]);
        let options = RestoreOptions {
            use_default_template: false,
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert!(info["x"].problems.contains(&Problem::MissingTemplate));
    }

    #[test]
    fn template_found_inside_the_backup_is_accepted() {
        let mut vm = entry("x", 2, VmKind::App);
        vm.template = Some("custom-tpl".to_owned());
        let backup = backup_with(vec![entry("custom-tpl", 1, VmKind::Template), vm]);
        let host = host(vec![]);
        let info = restore_info(&backup, &host, &RestoreOptions::default());
        assert_eq!(info["x"].template.as_deref(), Some("custom-tpl"));
        assert_eq!(info["x"].orig_template, None);
    }

    #[test]
    fn replace_template_map_wins() {
        let mut vm = entry("x", 1, VmKind::App);
        vm.template = Some("old-tpl".to_owned());
        let backup = backup_with(vec![vm]);
        let mut tpl_host = host(vec![entry("new-tpl", 9, VmKind::Template)]);
        tpl_host.default_template = None;
        let options = RestoreOptions {
            replace_template: [("old-tpl".to_owned(), "new-tpl".to_owned())]
                .into_iter()
                .collect(),
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &tpl_host, &options);
        assert_eq!(info["x"].template.as_deref(), Some("new-tpl"));
        assert_eq!(info["x"].orig_template.as_deref(), Some("old-tpl"));
        assert!(info["x"].good_to_go());
    }

    #[test]
    fn missing_netvm_policies() {
        let mut vm = entry("x", 1, VmKind::App);
        vm.netvm = Some("sys-custom".to_owned());
        let backup = backup_with(vec![vm]);
        let host = host(vec![]);

        let info = restore_info(&backup, &host, &RestoreOptions::default());
        assert_eq!(info["x"].netvm.as_deref(), Some("sys-net"));

        let options = RestoreOptions {
            use_default_netvm: false,
            use_none_netvm: true,
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert_eq!(info["x"].netvm, None);

        let options = RestoreOptions {
            use_default_netvm: false,
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert!(info["x"].problems.contains(&Problem::MissingNetvm));
    }

    #[test]
    fn excluded_vm_is_marked() {
        let backup = backup_with(vec![entry("work", 1, VmKind::App)]);
        let host = host(vec![]);
        let options = RestoreOptions {
            exclude: vec!["work".to_owned()],
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert!(info["work"].problems.contains(&Problem::Excluded));
    }

    #[test]
    fn admin_home_username_mismatch() {
        let mut admin = entry("dom0", 0, VmKind::Standalone);
        admin.backup_path = Some("dom0-home/alice".to_owned());
        let backup = backup_with(vec![admin]);
        let host = host(vec![]);

        let info = restore_info(&backup, &host, &RestoreOptions::default());
        assert_eq!(info["dom0"].username.as_deref(), Some("alice"));
        assert!(info["dom0"].problems.contains(&Problem::UsernameMismatch));

        let options = RestoreOptions {
            ignore_username_mismatch: true,
            ..RestoreOptions::default()
        };
        let info = restore_info(&backup, &host, &options);
        assert!(info["dom0"].good_to_go());
    }

    #[test]
    fn planning_is_idempotent() {
        let mut vm = entry("x", 1, VmKind::App);
        vm.template = Some("gone".to_owned());
        vm.netvm = Some("gone-net".to_owned());
        let backup = backup_with(vec![vm, entry("work", 2, VmKind::App)]);
        let host = host(vec![entry("work", 3, VmKind::App)]);
        let options = RestoreOptions::default();
        let first = restore_info(&backup, &host, &options);
        let second = restore_info(&backup, &host, &options);
        assert_eq!(first, second);
    }

    #[test]
    fn summary_is_deterministic_and_sorted() {
        let backup = backup_with(vec![
            entry("zeta", 2, VmKind::App),
            entry("alpha", 1, VmKind::App),
        ]);
        let host = host(vec![]);
        let info = restore_info(&backup, &host, &RestoreOptions::default());
        let summary = restore_summary(&info);
        let alpha = summary.find("alpha").unwrap();
        let zeta = summary.find("zeta").unwrap();
        assert!(alpha < zeta);
        assert_eq!(summary, restore_summary(&info));
    }
}
