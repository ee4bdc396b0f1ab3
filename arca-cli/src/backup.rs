//! The `backup` subcommand.

use crate::cli::BackupArgs;
use crate::host::FsInventory;
use crate::util::read_passphrase;
use anyhow::{Context, Result};
use arca::{Backup, BackupTarget, Cipher, Compression, EngineConfig, MacAlgorithm};
use tracing::{info, warn};

pub fn run(mut args: BackupArgs, inventory: &mut FsInventory) -> Result<()> {
    let mut encrypted = args.encrypt || args.dest_vm.is_some() || args.enc_algo.is_some();
    if args.no_encrypt {
        encrypted = false;
    }
    if !encrypted {
        warn!("the backup will NOT be encrypted");
    }

    // the destination VM can hardly be part of its own backup
    if let Some(dest_vm) = &args.dest_vm {
        info!(vm = %dest_vm, "excluding the backup destination from the backup");
        args.exclude.push(dest_vm.clone());
    }

    let mut config = EngineConfig::default();
    if let Some(tmpdir) = &args.tmpdir {
        config.scratch_root = tmpdir.clone();
    }
    if let Some(name) = &args.hmac_algo {
        config.default_mac = MacAlgorithm::from_name(name)
            .with_context(|| format!("unsupported MAC algorithm {name:?}"))?;
    }
    if let Some(name) = &args.enc_algo {
        config.default_cipher = Cipher::from_name(name)
            .with_context(|| format!("unsupported cipher {name:?}"))?;
    }

    let target = match &args.dest_vm {
        Some(vm) => BackupTarget::HelperVm {
            vm: vm.clone(),
            path: args.dest.display().to_string(),
        },
        None => BackupTarget::LocalFile(args.dest.clone()),
    };

    let passphrase = read_passphrase(
        args.passphrase_file.as_deref(),
        &format!(
            "Please enter the passphrase that will be used to {}verify the backup: ",
            if encrypted { "encrypt and " } else { "" }
        ),
    )?;

    let mut backup = Backup::new(inventory, config, target, passphrase);
    backup.encrypted = encrypted;
    backup.compression = match (&args.compress_filter, args.compress) {
        (Some(filter), _) => Compression::Named(filter.clone()),
        (None, true) => Compression::Default,
        (None, false) => Compression::None,
    };
    if !args.vms.is_empty() {
        backup.selection = Some(args.vms.clone());
    }
    backup.exclude = args.exclude.clone();

    println!("{}", backup.summary()?);
    backup.backup_do()?;
    info!("backup completed");
    Ok(())
}
