//! Command line surface: argument types and their conversion into engine
//! options.

use clap::{ArgAction, Args, Parser, Subcommand};

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "arca",
    about = "Streaming, authenticated VM backup and restore",
    version
)]
pub struct Opt {
    /// Increase log verbosity (repeatable)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Root of the host inventory
    #[arg(long, global = true, default_value = "/var/lib/arca")]
    pub inventory_root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a backup archive of the selected VMs
    Backup(BackupArgs),
    /// Verify a backup archive, or restore VMs from it
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Destination path: a file, or a directory to create a timestamped
    /// file in
    #[arg(long)]
    pub dest: PathBuf,

    /// Send the backup to this VM instead of the local filesystem
    /// (implies --encrypt)
    #[arg(long)]
    pub dest_vm: Option<String>,

    /// Encrypt the archive
    #[arg(long)]
    pub encrypt: bool,

    /// Skip encryption even when it would otherwise be implied
    #[arg(long, conflicts_with = "encrypt")]
    pub no_encrypt: bool,

    /// Compress the archive with the default filter
    #[arg(long, short = 'z')]
    pub compress: bool,

    /// Compress with a specific filter program (implies --compress)
    #[arg(long, short = 'Z')]
    pub compress_filter: Option<String>,

    /// Cipher name (implies --encrypt)
    #[arg(long)]
    pub enc_algo: Option<String>,

    /// MAC algorithm name
    #[arg(long)]
    pub hmac_algo: Option<String>,

    /// Read the passphrase from a file, `-` for standard input
    #[arg(long, short = 'p')]
    pub passphrase_file: Option<PathBuf>,

    /// Exclude a VM from the backup (repeatable)
    #[arg(long = "exclude", short = 'x')]
    pub exclude: Vec<String>,

    /// Directory for temporary chunk files
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// VMs to back up; every VM that opts in when empty
    pub vms: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Source path of the archive
    #[arg(long)]
    pub source: PathBuf,

    /// Fetch the archive from this VM instead of the local filesystem
    #[arg(long)]
    pub source_vm: Option<String>,

    /// Verify archive integrity without restoring anything
    #[arg(long)]
    pub verify_only: bool,

    /// Skip members that fail verification and VMs with unresolved
    /// problems
    #[arg(long)]
    pub skip_broken: bool,

    /// Restore VMs even when their template or netvm is missing, by
    /// substituting defaults
    #[arg(long, conflicts_with = "skip_broken")]
    pub ignore_missing: bool,

    /// Skip VMs whose name is already taken on the host
    #[arg(long)]
    pub skip_conflicting: bool,

    /// Rename VMs whose name is already taken on the host
    #[arg(long, conflicts_with = "skip_conflicting")]
    pub rename_conflicting: bool,

    /// Use template NEW instead of OLD, as `OLD:NEW` (repeatable)
    #[arg(long = "replace-template", value_parser = parse_replacement)]
    pub replace_template: Vec<(String, String)>,

    /// Exclude a VM from the restore (repeatable)
    #[arg(long = "exclude", short = 'x')]
    pub exclude: Vec<String>,

    /// Do not restore the management domain's home directory
    #[arg(long)]
    pub skip_dom0_home: bool,

    /// Restore the home directory even when the stored username differs
    #[arg(long)]
    pub ignore_username_mismatch: bool,

    /// Read the passphrase from a file, `-` for standard input
    #[arg(long, short = 'p')]
    pub passphrase_file: Option<PathBuf>,

    /// Accept headerless legacy version-1 archives
    #[arg(long)]
    pub allow_legacy_v1: bool,
}

fn parse_replacement(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => {
            Ok((old.to_owned(), new.to_owned()))
        }
        _ => Err(format!("expected OLD:NEW, got {raw:?}")),
    }
}

impl RestoreArgs {
    pub fn restore_options(&self) -> arca::RestoreOptions {
        let replace_template: HashMap<String, String> =
            self.replace_template.iter().cloned().collect();
        arca::RestoreOptions {
            use_default_template: true,
            use_default_netvm: true,
            use_none_netvm: false,
            restore_admin_home: !self.skip_dom0_home,
            ignore_username_mismatch: self.ignore_username_mismatch,
            replace_template,
            verify_only: self.verify_only,
            rename_conflicting: self.rename_conflicting,
            skip_broken: self.skip_broken,
            ignore_missing: self.ignore_missing,
            exclude: self.exclude.clone(),
            allow_legacy_v1: self.allow_legacy_v1,
        }
    }
}
