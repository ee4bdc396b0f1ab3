//! The `restore` subcommand.

use crate::cli::RestoreArgs;
use crate::host::FsInventory;
use crate::util::read_passphrase;
use anyhow::Result;
use arca::{BackupRestore, EngineConfig, Problem, RestoreLocation};
use tracing::{info, warn};

pub fn run(args: RestoreArgs, inventory: &mut FsInventory) -> Result<()> {
    let location = match &args.source_vm {
        Some(vm) => RestoreLocation::HelperVm {
            vm: vm.clone(),
            path: args.source.display().to_string(),
        },
        None => RestoreLocation::LocalFile(args.source.clone()),
    };
    let passphrase = read_passphrase(
        args.passphrase_file.as_deref(),
        "Please enter the passphrase used to verify the backup: ",
    )?;

    let mut options = args.restore_options();
    let mut restore = BackupRestore::new(
        inventory,
        EngineConfig::default(),
        location,
        passphrase,
        options.clone(),
    )?;

    let mut info = restore.restore_info();
    if args.skip_conflicting {
        // conflicting VMs become explicit exclusions, then the plan is
        // rebuilt; planning is idempotent so this converges
        let conflicting: Vec<String> = info
            .iter()
            .filter(|(_, slot)| slot.problems.contains(&Problem::AlreadyExists))
            .map(|(name, _)| name.clone())
            .collect();
        for name in conflicting {
            warn!(vm = %name, "name already taken, skipping");
            options.exclude.push(name);
        }
        restore.options = options;
        info = restore.restore_info();
    }

    println!("{}", arca::plan::restore_summary(&info));
    let report = restore.restore_do(&info)?;

    for member in &report.failed {
        warn!(member = %member, "member failed verification or extraction");
    }
    if args.verify_only {
        info!(members = report.done.len(), "archive verified");
    } else {
        info!(members = report.done.len(), "restore completed");
    }
    Ok(())
}
